use crate::combat::damage::DamageRule;
use crate::combat::rules::CombatRules;
use crate::telemetry::logging::LogLevel;
use crate::world::behavior::BehaviorConfig;
use crate::world::registry::RegistryConfig;
use crate::world::visibility::VisibilityConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "overworld.yaml";

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub engine: EngineConfig,
    /// Stop after this many seconds; runs until shut down when unset.
    pub run_secs: Option<u64>,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err("usage: overworld <world-root> [config.yaml]".to_string());
        }

        let root = Path::new(&args[1]).to_path_buf();
        let config_path = if args.len() > 2 {
            PathBuf::from(&args[2])
        } else {
            root.join(DEFAULT_CONFIG_FILE)
        };
        let mut engine = if config_path.exists() {
            EngineConfig::load(&config_path)?
        } else if args.len() > 2 {
            return Err(format!("config file {} not found", config_path.display()));
        } else {
            EngineConfig::default()
        };

        if let Some(value) = env_value("OVERWORLD_PROCESS_ID") {
            engine.process_id = value
                .parse()
                .map_err(|err| format!("invalid OVERWORLD_PROCESS_ID '{}': {}", value, err))?;
        }
        if let Some(value) = env_value("OVERWORLD_LOG_LEVEL") {
            LogLevel::parse(&value)?;
            engine.log_level = value;
        }
        let run_secs = match env_value("OVERWORLD_RUN_SECS") {
            Some(value) => Some(
                value
                    .parse()
                    .map_err(|err| format!("invalid OVERWORLD_RUN_SECS '{}': {}", value, err))?,
            ),
            None => None,
        };

        Ok(Self {
            root,
            config_path,
            engine,
            run_secs,
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub process_id: u32,
    pub diff_interval_ms: u64,
    pub view_radius: f32,
    pub sector_size: f32,
    pub think_interval_ms: u64,
    pub roam_interval_ms: RoamInterval,
    pub respawn_delay_ms: u64,
    pub drop_expiry_ms: u64,
    pub claim_duration_ms: u64,
    pub loot_radius: f32,
    pub presentation_capacity: u16,
    pub max_tasks: usize,
    pub worker_threads: usize,
    pub lag_budget_ms: u64,
    pub bus_dedup_capacity: usize,
    pub log_level: String,
    pub pvp_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoamInterval {
    pub min: u64,
    pub max: u64,
}

impl Default for RoamInterval {
    fn default() -> Self {
        Self {
            min: 3000,
            max: 8000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_id: 1,
            diff_interval_ms: 1000,
            view_radius: 15.0,
            sector_size: 16.0,
            think_interval_ms: 500,
            roam_interval_ms: RoamInterval::default(),
            respawn_delay_ms: 10_000,
            drop_expiry_ms: 60_000,
            claim_duration_ms: 15_000,
            loot_radius: 2.0,
            presentation_capacity: u16::MAX,
            max_tasks: 65_536,
            worker_threads: 4,
            lag_budget_ms: 50,
            bus_dedup_capacity: 4096,
            log_level: "info".to_string(),
            pvp_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read {}: {}", path.display(), err))?;
        Self::from_yaml_str(&content)
            .map_err(|err| format!("failed to parse {}: {}", path.display(), err))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, String> {
        let config: EngineConfig =
            serde_yaml::from_str(content).map_err(|err| err.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.view_radius <= 0.0 {
            return Err("view_radius must be positive".to_string());
        }
        if self.sector_size <= 0.0 {
            return Err("sector_size must be positive".to_string());
        }
        if self.roam_interval_ms.min > self.roam_interval_ms.max {
            return Err("roam_interval_ms.min exceeds max".to_string());
        }
        if self.presentation_capacity == 0 {
            return Err("presentation_capacity must be at least 1".to_string());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be at least 1".to_string());
        }
        LogLevel::parse(&self.log_level)?;
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level).unwrap_or(LogLevel::Info)
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            sector_size: self.sector_size,
            presentation_capacity: self.presentation_capacity,
        }
    }

    pub fn combat(&self) -> CombatRules {
        CombatRules {
            pvp_enabled: self.pvp_enabled,
            damage_rule: DamageRule::Standard,
            drop_expiry: Duration::from_millis(self.drop_expiry_ms),
            claim_duration: Duration::from_millis(self.claim_duration_ms),
            ..CombatRules::default()
        }
    }

    pub fn behavior(&self) -> BehaviorConfig {
        BehaviorConfig {
            think_interval: Duration::from_millis(self.think_interval_ms),
            roam_interval_min: Duration::from_millis(self.roam_interval_ms.min),
            roam_interval_max: Duration::from_millis(self.roam_interval_ms.max),
            respawn_delay: Duration::from_millis(self.respawn_delay_ms),
            lag_budget: Duration::from_millis(self.lag_budget_ms),
        }
    }

    pub fn visibility(&self) -> VisibilityConfig {
        VisibilityConfig {
            diff_interval: Duration::from_millis(self.diff_interval_ms),
            view_radius: self.view_radius,
            lag_budget: Duration::from_millis(self.lag_budget_ms),
        }
    }
}
