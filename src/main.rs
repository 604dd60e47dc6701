use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lora_nexus::app;
use lora_nexus::config::Config;
use lora_nexus::mac::MacEngine;
use lora_nexus::maccmd::DefaultMacHandler;
use lora_nexus::store::Store;
use lora_nexus::udp;

#[derive(Parser)]
#[command(name = "lora-nexus")]
#[command(about = "LoRaWAN 1.0.1 Class-A network server for Semtech UDP packet forwarders")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-nexus v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("LoRaWAN 1.0.1 Class-A Network Server");
    info!("===========================================");

    // Provision the session store from the config tables
    let store = Arc::new(Store::new());
    config.provision(&store)?;
    info!(
        "Provisioned {} gateway(s), {} device(s), {} ignore pattern(s), {} multicast group(s)",
        config.gateways.len(),
        config.devices.len(),
        config.ignored.len(),
        config.multicast.len()
    );

    // Every device binding must resolve to a registered application
    let apps = app::default_registry();
    for device in &config.devices {
        if !apps.contains_key(&device.app) {
            anyhow::bail!("device {} bound to unknown application {:?}", device.deveui, device.app);
        }
    }

    let engine = Arc::new(MacEngine::new(
        store,
        apps,
        Arc::new(DefaultMacHandler),
        config.engine.preprocessing_delay_ms,
    ));

    // Start the UDP packet-forwarder server
    info!("Starting Semtech UDP Packet Forwarder server...");
    let _downlink_sender = udp::start_server(&config, engine).await?;

    info!("Server running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}
