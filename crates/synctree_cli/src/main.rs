//! synctree CLI
//!
//! Command-line tools for synctree directories.
//!
//! # Commands
//!
//! - `inspect` - Display directory counters and sync metadata
//! - `dump` - List live entries in tree order
//! - `ordinal-between` - Compute a position between two ordinals
//! - `ordinal-from-int` - Convert an integer position to an ordinal

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// synctree command-line tools.
#[derive(Parser)]
#[command(name = "synctree")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a directory folder (or its snapshot file)
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display directory counters and sync metadata
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List live entries in tree order
    Dump {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Compute an ordinal strictly between two hex ordinals
    OrdinalBetween {
        /// First ordinal, hex
        first: String,
        /// Second ordinal, hex
        second: String,
    },

    /// Convert an integer position to an ordinal
    OrdinalFromInt {
        /// Integer position
        #[arg(allow_hyphen_values = true)]
        value: i64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Directory path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Dump { format } => {
            let path = cli.path.ok_or("Directory path required for dump")?;
            commands::dump::run(&path, &format)?;
        }
        Commands::OrdinalBetween { first, second } => {
            println!("{}", commands::ordinal::between(&first, &second)?);
        }
        Commands::OrdinalFromInt { value } => {
            println!("{}", commands::ordinal::from_int(value));
        }
        Commands::Version => {
            println!("synctree CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("synctree core v{}", synctree_core::VERSION);
            println!("synctree engine v{}", synctree_engine::VERSION);
        }
    }

    Ok(())
}
