pub mod combat;
mod config;
pub mod entities;
pub mod host;
pub mod net;
pub mod persistence;
pub mod runtime;
pub mod telemetry;
pub mod world;

pub use config::{AppConfig, EngineConfig, RoamInterval};
pub use host::{ServerControl, ServerExit, WorldHost};

use entities::template::TemplateIndex;
use persistence::journal::FileJournal;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use telemetry::logging;
use world::loader::WorldDefinition;

const TEMPLATE_FILE: &str = "templates.yaml";
const WORLD_FILE: &str = "world.yaml";
const LOAD_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const REAP_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: &[String]) -> Result<(), String> {
    loop {
        let config = AppConfig::from_args(args)?;
        logging::init(&config.root, config.engine.log_level())?;
        let templates = TemplateIndex::load(&config.root.join(TEMPLATE_FILE))?;
        let world = WorldDefinition::load(&config.root.join(WORLD_FILE))?;
        let journal = FileJournal::open(&config.root)?;

        let host = WorldHost::start(config.engine.clone(), Arc::new(templates), Arc::new(journal))?;
        let report = host.load_world(&world);
        println!("overworld: world loaded");
        println!("- root: {}", config.root.display());
        println!("- config: {}", config.config_path.display());
        println!("- process id: {}", config.engine.process_id);
        println!("- shards: {}", report.shards);
        println!("- maps: {}", report.maps);
        println!("- spawn areas: {}", report.spawns);
        println!("- entities: {}", report.entities);
        if !report.unknown_templates.is_empty() {
            for template in &report.unknown_templates {
                eprintln!("overworld: unknown template {}", template.0);
            }
        }

        let control = Arc::new(ServerControl::new());
        let started = Instant::now();
        let mut next_sample = started;
        while control.is_running() {
            if let Some(secs) = config.run_secs {
                if started.elapsed() >= Duration::from_secs(secs) {
                    control.request_shutdown();
                    break;
                }
            }
            let now = Instant::now();
            if now >= next_sample {
                logging::log_load(host.load_sample());
                next_sample = now + LOAD_SAMPLE_INTERVAL;
            }
            host.reap_failed();
            thread::sleep(REAP_INTERVAL);
        }

        let exit = control.exit_reason();
        host.shutdown();
        match exit {
            ServerExit::Shutdown => return Ok(()),
            ServerExit::Restart => {
                println!("overworld: restart requested, reloading world");
                logging::log_game("restart requested");
            }
        }
    }
}
