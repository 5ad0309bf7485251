//! Command-line driver: runs the connector against the simulated printer.

use bambu_connector::simulator::SimulatedPrinterFactory;
use bambu_connector::{BambuConnector, ConnectorConfig, TracingListener, load_config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "bambu-connector", about = "Drive a Bambu printer connection from the command line.")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "printer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and log state changes and telemetry
    Watch {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// List files stored on the printer
    Files {
        #[arg(long)]
        refresh: bool,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send raw G-code lines
    Gcode {
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    let config: ConnectorConfig = load_config(&cli.config).map_err(|e| {
        eprintln!("Failed to load config from '{}': {}", cli.config.display(), e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    tracing_subscriber::fmt()
        .with_max_level(config.logging.max_level()?)
        .init();
    tracing::info!("Bambu connector {}", env!("CARGO_PKG_VERSION"));

    let factory = Arc::new(SimulatedPrinterFactory::default());
    let connector = BambuConnector::from_config(&config, factory, Arc::new(TracingListener))?;

    if !connector.connect()?.wait()? {
        let reason = connector.error().unwrap_or_else(|| "unknown error".to_string());
        tracing::error!("Connection failed: {}", reason);
        return Err(reason.into());
    }

    match cli.command {
        Commands::Watch { seconds } => {
            std::thread::sleep(Duration::from_secs(seconds));
            let snapshot = connector.status_snapshot();
            tracing::info!(
                "Final state {} (job {:?}, idle {:?}, firmware {})",
                connector.current_state(),
                snapshot.job,
                snapshot.idle,
                snapshot.firmware
            );
        }
        Commands::Files { refresh, json } => {
            let files = connector.get_files(refresh)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                for file in &files {
                    println!("{}\t{}\t{}", file.path, file.size, file.date);
                }
            }
        }
        Commands::Gcode { commands } => {
            connector.send_commands(&commands)?.wait()?;
            tracing::info!("Sent {} command(s)", commands.len());
        }
    }

    connector.shutdown();
    Ok(())
}
