use overworld::entities::template::TemplateIndex;
use overworld::world::loader::WorldDefinition;
use std::path::Path;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Err("usage: world_validate <world-root>".to_string());
    }
    let root = Path::new(&args[1]);
    let templates = TemplateIndex::load(&root.join("templates.yaml"))?;
    let world = WorldDefinition::load(&root.join("world.yaml"))?;
    let report = world.validate(&templates);

    println!("world_validate: {}", root.display());
    println!("- templates: {}", templates.len());
    println!("- shards: {}", report.shards);
    println!("- maps: {}", report.maps);
    println!("- spawn areas: {}", report.spawns);
    println!("- entities: {}", report.entities);
    if report.unknown_templates.is_empty() {
        return Ok(());
    }
    for template in &report.unknown_templates {
        eprintln!("world_validate: unknown template {}", template.0);
    }
    Err(format!(
        "{} unknown template reference(s)",
        report.unknown_templates.len()
    ))
}
