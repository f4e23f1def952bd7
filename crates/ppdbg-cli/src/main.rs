//! ppdbg CLI - Command-line client for the PPSSPP remote debugger.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod settings;

use settings::{LogFormat, Overrides};

/// ppdbg - Talk to a running PPSSPP debugger
#[derive(Parser, Debug)]
#[command(name = "ppdbg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: ./ppdbg.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debugger URI, e.g. ws://192.168.1.20:45023/debugger (skips discovery)
    #[arg(short, long, global = true)]
    uri: Option<String>,

    /// Discovery service URL
    #[arg(long, global = true)]
    discovery_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    /// Directory for saved breakpoints
    #[arg(long, global = true)]
    breakpoint_dir: Option<PathBuf>,

    /// Save and restore breakpoints per game
    #[arg(long, global = true)]
    persist_breakpoints: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one request and print the reply
    Send {
        /// Event name, e.g. cpu.getReg
        event: String,
        /// Extra fields as a JSON object, e.g. '{"name":"pc"}'
        fields: Option<String>,
    },

    /// Print events until interrupted
    Watch {
        /// Only print these events (default: all)
        events: Vec<String>,
    },

    /// Show emulator status
    Status,

    /// Show version information
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let log_level = match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        };

        Overrides {
            uri: self.uri.clone(),
            discovery_url: self.discovery_url.clone(),
            log_level: log_level.map(str::to_string),
            log_format: self.log_format,
            breakpoint_dir: self.breakpoint_dir.clone(),
            persist_breakpoints: self.persist_breakpoints,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("ppdbg {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let settings = match settings::load(cli.config.as_deref(), &cli.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    };
    logging::init_logging(&settings.log_level, settings.log_format);

    let result = match cli.command {
        Commands::Send { event, fields } => {
            commands::send(&settings, &event, fields.as_deref()).await
        }
        Commands::Watch { events } => commands::watch(&settings, &events).await,
        Commands::Status => commands::status(&settings).await,
        Commands::Version => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
