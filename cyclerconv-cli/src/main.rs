//! cyclerconv CLI - Maccor to BioLogic protocol conversion from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cyclerconv::{
    rules_path_for, ConversionOptions, ConvertedProtocol, CycleAdvancementRules,
    CycleAdvancementRulesSerializer, ProtocolConverter, TableLayout, TelemetryTable,
};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "cyclerconv")]
#[command(about = "Maccor procedure to BioLogic Modulo Bat converter", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a Maccor procedure into a sequence table and cycle rules
    Convert {
        /// Path to Maccor procedure (.000 or .xml)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Sequence table output path (default: next to FILE)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cycle rules output path (default: OUTPUT with .rules.json)
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Table layout
        #[arg(short, long, value_enum)]
        layout: Option<LayoutArg>,

        /// JSON file with conversion options
        #[arg(long, value_name = "JSON")]
        config: Option<PathBuf>,

        /// Keep a looping tail as a Loop sequence instead of a looping technique
        #[arg(long)]
        no_technique_loop: bool,

        /// Upper bound on generated sequences
        #[arg(long)]
        max_sequences: Option<usize>,
    },

    /// Show how a procedure converts without writing files
    Inspect {
        /// Path to Maccor procedure (.000 or .xml)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Keep a looping tail as a Loop sequence instead of a looping technique
        #[arg(long)]
        no_technique_loop: bool,
    },

    /// Validate and summarize a cycle rules file
    Rules {
        /// Path to a .rules.json file
        #[arg(value_name = "RULES")]
        file: PathBuf,
    },

    /// Normalize a delimited cycler telemetry table to canonical columns
    Normalize {
        /// Path to the telemetry table
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Field delimiter of input and output
        #[arg(short, long, default_value = ",")]
        delimiter: char,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    /// Tab separated rows, one per sequence
    Rows,
    /// BioLogic settings layout
    Mps,
}

impl From<LayoutArg> for TableLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Rows => TableLayout::Rows,
            LayoutArg::Mps => TableLayout::Mps,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Convert {
            file,
            output,
            rules,
            layout,
            config,
            no_technique_loop,
            max_sequences,
        } => {
            let overrides = Overrides {
                layout: layout.map(TableLayout::from),
                no_technique_loop,
                max_sequences,
            };
            handle_convert(&file, output, rules, config.as_deref(), overrides)
        }
        Commands::Inspect {
            file,
            format,
            no_technique_loop,
        } => handle_inspect(&file, format, no_technique_loop),
        Commands::Rules { file } => handle_rules(&file),
        Commands::Normalize {
            file,
            output,
            delimiter,
        } => handle_normalize(&file, output.as_deref(), delimiter),
    };

    let exit_code = match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    process::exit(exit_code);
}

/// Flags that take precedence over the config file.
struct Overrides {
    layout: Option<TableLayout>,
    no_technique_loop: bool,
    max_sequences: Option<usize>,
}

fn load_options(config: Option<&Path>, overrides: Overrides) -> Result<ConversionOptions> {
    let mut options = match config {
        Some(path) => ConversionOptions::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => ConversionOptions::default(),
    };
    if let Some(layout) = overrides.layout {
        options.layout = layout;
    }
    if overrides.no_technique_loop {
        options.technique_loop = false;
    }
    if let Some(max) = overrides.max_sequences {
        options.max_sequence_entries = max;
    }
    Ok(options)
}

fn default_table_path(file: &Path, layout: TableLayout) -> PathBuf {
    match layout {
        TableLayout::Rows => file.with_extension("tsv"),
        TableLayout::Mps => file.with_extension("mps"),
    }
}

fn handle_convert(
    file: &Path,
    output: Option<PathBuf>,
    rules: Option<PathBuf>,
    config: Option<&Path>,
    overrides: Overrides,
) -> Result<()> {
    let options = load_options(config, overrides)?;
    let table_path = output.unwrap_or_else(|| default_table_path(file, options.layout));
    let rules_path = rules.unwrap_or_else(|| rules_path_for(&table_path));

    let converter = ProtocolConverter::new(options);
    let protocol = converter
        .convert_file(file)
        .with_context(|| format!("converting {}", file.display()))?;
    let written = converter
        .write_outputs(&protocol, &table_path, &rules_path)
        .context("writing outputs")?;

    println!(
        "Converted {} -> {} sequences in {} technique(s)",
        file.display(),
        protocol.entry_count(),
        protocol.techniques.len()
    );
    println!("  Table: {}", written.table.display());
    println!("  Rules: {}", written.rules.display());
    Ok(())
}

fn handle_inspect(file: &Path, format: OutputFormat, no_technique_loop: bool) -> Result<()> {
    let options = ConversionOptions {
        technique_loop: !no_technique_loop,
        ..Default::default()
    };
    let protocol = ProtocolConverter::new(options)
        .convert_file(file)
        .with_context(|| format!("converting {}", file.display()))?;

    match format {
        OutputFormat::Human => output_human(file, &protocol),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&protocol)?),
    }
    Ok(())
}

fn output_human(file: &Path, protocol: &ConvertedProtocol) {
    println!("\nFile: {}", file.display());
    println!("{}", "─".repeat(60));

    for tech in &protocol.techniques {
        print!(
            "\n  Technique {} (steps {}-{})",
            tech.number, tech.first_step, tech.last_step
        );
        match tech.loop_count {
            Some(count) => println!(", runs {} times", count),
            None => println!(),
        }
        for entry in &tech.entries {
            let limits: Vec<String> = entry
                .active_limits()
                .iter()
                .map(|l| format!("{} {} {} -> {} {}", l.measure, l.comparator, l.value, l.action, l.seq))
                .collect();
            println!(
                "    {:>4}  {:<5} {:<10} {:<18} {}",
                entry.ns,
                entry.ctrl_type.as_str(),
                entry.polarity.as_str(),
                entry.ctrl1.to_string(),
                limits.join("; ")
            );
        }
    }

    println!();
    print_rules(&protocol.rules);
}

fn print_rules(rules: &CycleAdvancementRules) {
    println!("  Cycle rules:");
    println!("    Techniques:      {}", rules.tech_num);
    println!("    Technique loops: {}", rules.tech_does_loop);
    println!("    On start:        {}", rules.adv_cycle_on_start);
    println!("    On tech loop:    {}", rules.adv_cycle_on_tech_loop);
    for ((from, to), adv) in &rules.adv_cycle_seq_transitions {
        println!("    seq {} -> {}: +{}", from, to, adv);
    }
}

fn handle_rules(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let rules = CycleAdvancementRulesSerializer
        .parse_json(&text)
        .with_context(|| format!("parsing {}", file.display()))?;
    println!("Rules file: {}", file.display());
    print_rules(&rules);
    Ok(())
}

fn handle_normalize(file: &Path, output: Option<&Path>, delimiter: char) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let table = TelemetryTable::from_delimited(&text, delimiter)
        .with_context(|| format!("normalizing {}", file.display()))?;
    let normalized = table.to_delimited(delimiter);

    match output {
        Some(path) => {
            std::fs::write(path, normalized).with_context(|| format!("writing {}", path.display()))?;
            println!("Normalized {} rows -> {}", table.row_count, path.display());
        }
        None => print!("{}", normalized),
    }
    Ok(())
}
