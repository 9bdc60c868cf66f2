//! ELM327 MQTT Bridge - Main Entry Point
//!
//! Usage:
//!   elm327-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file (TOML)
//!   -l, --log-level <LEVEL>  Log level (error, warn, info, debug, trace)

use anyhow::Context;
use clap::{Parser, ValueEnum};
use elm_bridge::{init_logging, Bridge, BridgeConfig};
use std::path::PathBuf;
use tracing::{info, warn, Level};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Bridge an ELM327 Bluetooth adapter to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "elm327-bridge", version, about)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load(args.config.as_deref()).context("loading configuration")?;
    let level = match args.log_level {
        Some(level) => level.to_tracing_level(),
        None => config.level()?,
    };
    init_logging(level, config.log_json)?;

    info!("=== ELM327 MQTT Bridge v{} ===", env!("CARGO_PKG_VERSION"));

    let bridge = Bridge::from_config(&config)?;
    let runner = bridge.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    let finished = tokio::select! {
        finished = &mut run => Some(finished),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    bridge.stop().await;
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            None
        }
    };

    match finished {
        Some(finished) => finished??,
        None => run.await??,
    }
    Ok(())
}
