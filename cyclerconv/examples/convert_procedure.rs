//! Convert a Maccor procedure and print the sequence table and cycle rules.

use cyclerconv::prelude::*;
use std::path::Path;

fn main() -> Result<(), ConvertError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tests/fixtures/diagnostic.000".to_string());
    let path = Path::new(&path);

    if !path.exists() {
        eprintln!("File not found: {}", path.display());
        eprintln!("Usage: cargo run --example convert_procedure [path/to/procedure.000]");
        std::process::exit(1);
    }

    let converter = ProtocolConverter::new(ConversionOptions {
        layout: TableLayout::Mps,
        ..Default::default()
    });
    let protocol = converter.convert_file(path)?;

    println!("Conversion results for: {}", path.display());
    println!("Techniques: {}", protocol.techniques.len());
    println!("Sequences: {}", protocol.entry_count());
    println!();

    for tech in &protocol.techniques {
        match tech.loop_count {
            Some(count) => println!(
                "Technique {} (steps {}-{}) runs {} times",
                tech.number, tech.first_step, tech.last_step, count
            ),
            None => println!("Technique {} (steps {}-{})", tech.number, tech.first_step, tech.last_step),
        }
    }
    println!();

    print!("{}", converter.render_table(&protocol));
    println!();
    println!("{}", CycleAdvancementRulesSerializer.json(&protocol.rules)?);

    Ok(())
}
