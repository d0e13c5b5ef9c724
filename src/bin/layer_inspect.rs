//! Inspect layer archives and validate layer options.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use layered_image::archive::snapshot::ConstantState;
use layered_image::archive::{LayerArchive, LayerOption};
use layered_image::core::{BuildConfig, LayerError};

#[derive(Parser)]
#[command(name = "layer-inspect")]
#[command(about = "Inspect layered image build archives", long_about = None)]
#[command(version)]
struct Cli {
    /// Raise the log level (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the properties and recorded state of a layer archive
    Inspect {
        /// Path to a .nil layer archive
        archive: PathBuf,
        /// Platform the archive is expected to target (defaults to the host)
        #[arg(long)]
        platform: Option<String>,
    },
    /// Validate a layer option string
    ParseOption {
        /// Option text, e.g. "out/libbase.nil,module=java.base"
        text: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn inspect(path: PathBuf, platform: Option<String>) -> Result<(), LayerError> {
    let mut config = BuildConfig::from_env()?;
    if let Some(platform) = platform {
        config.platform = platform;
    }
    let archive = LayerArchive::open(&path, &config)?;
    let props = archive.properties();
    let snapshot = archive.snapshot();

    println!("Layer: {} ({}, {})", props.layer_name, props.role, props.layer_id);
    println!("  Platform: {}", props.platform);
    println!("  Artifact: {}", props.artifact_name);
    println!("  Snapshot SHA-256: {}", props.snapshot_sha256);
    println!("  Builder arguments: {}", archive.arguments().join(" "));

    println!("Constants ({}):", snapshot.constants.len());
    for record in &snapshot.constants {
        match &record.state {
            ConstantState::Committed { object_id, layer } => {
                println!("  {} = object #{} (committed in {})", record.key, object_id, layer)
            }
            ConstantState::FuturePending { declared_type, layer } => {
                println!("  {}: {} (future, reserved in {})", record.key, declared_type, layer)
            }
            ConstantState::FutureFinalized {
                declared_type,
                object_id,
                finalized_in,
            } => println!(
                "  {}: {} = object #{} (future, finalized in {})",
                record.key, declared_type, object_id, finalized_in
            ),
        }
    }

    println!("Singletons ({}):", snapshot.singletons.len());
    for record in &snapshot.singletons {
        let mut line = format!("  {} {}", record.flag, record.type_name);
        if record.object_id >= 0 {
            line.push_str(&format!(" -> object #{}", record.object_id));
        }
        if record.initial_layer_only {
            line.push_str(" [initial layer only]");
        }
        if let Some(key) = &record.constant_key {
            line.push_str(&format!(" [constant '{}']", key));
        }
        println!("{}", line);
    }

    println!("Symbols ({}):", snapshot.symbols.len());
    for symbol in &snapshot.symbols {
        println!("  {} ({})", symbol.name, symbol.layer);
    }

    println!("Compilation behaviors ({}):", snapshot.behaviors.len());
    for record in &snapshot.behaviors {
        println!("  {}: {}", record.entity, record.behavior);
    }
    Ok(())
}

fn parse_option(text: &str) -> Result<(), LayerError> {
    let option = LayerOption::parse(text)?;
    match &option.layer_file {
        Some(path) => println!("Layer file: {}", path.display()),
        None => println!("Layer file: (none)"),
    }
    for extended in &option.extended {
        match &extended.value {
            Some(value) => println!("  {} = {}", extended.key, value),
            None => println!("  {}", extended.key),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Inspect { archive, platform } => inspect(archive, platform),
        Commands::ParseOption { text } => parse_option(&text),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_user_facing() => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("internal error: {}", e);
            ExitCode::from(2)
        }
    }
}
