// src/main.rs - Command-line entry point for the Marlin bridge
use clap::Parser;
use marlin_bridge::communication::{BridgeEvent, Serial2Interface, SerialInterface};
use marlin_bridge::{Bridge, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Parser)]
#[command(name = "marlin-bridge", version, about = "Moonraker-compatible bridge for Marlin printers")]
struct Args {
    /// Configuration file
    #[arg(default_value = "printer.toml")]
    config: PathBuf,

    /// Log serial traffic and routing decisions
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else if args.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let transport = Arc::new(Serial2Interface);
    if args.list_ports {
        for port in transport.available_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    tracing::info!("Starting marlin-bridge");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", args.config.display());

    let config = load_config(&args.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", args.config.display(), e);
        tracing::error!("Please ensure the configuration file exists and is properly formatted");
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    match config.serial.baud_rate {
        Some(baud) => tracing::info!("Serial: {} @ {} baud", config.serial.port, baud),
        None => tracing::info!("Serial: {} (auto baud)", config.serial.port),
    }
    tracing::info!("G-code directory: {}", config.printer.gcode_dir.display());
    tracing::info!("{} user macro(s) configured", config.macros.len());

    let bridge = Bridge::start(config, transport);
    let mut events = bridge.events().subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(BridgeEvent::StateChanged { .. }) => {}
                Ok(BridgeEvent::GcodeResponse(line)) => tracing::info!("{}", line),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    bridge.stop().await;
    tracing::info!("marlin-bridge stopped");
    Ok(())
}
