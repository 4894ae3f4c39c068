//! Simulated openWB Dimm- und Control-Kit.
//!
//! Serves Modbus TCP from a register bank whose discrete inputs follow
//! MQTT topics.

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_bridge_modbus::Simulator;
use mqtt_bridge_modbus::config::SimulatorConfig;
use std::path::PathBuf;
use tracing::info;

/// Modbus TCP device simulator driven by MQTT.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-modbus")]
#[command(about = "Simulated Modbus field device whose inputs follow MQTT topics")]
#[command(version)]
struct Args {
    /// Path to settings file (JSON5 format). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the device configuration document path.
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimulatorConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => SimulatorConfig::default(),
    };
    if let Some(store) = args.store {
        config.store.path = store;
    }

    let log_config = config
        .logging
        .clone()
        .with_level_override(args.log_level.as_deref());
    dimmsim_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mqtt-bridge-modbus");
    match &args.config {
        Some(path) => info!("Loaded settings from {:?}", path),
        None => info!("Using default settings"),
    }

    let simulator = Simulator::bind(&config).await?;
    simulator.run().await
}
