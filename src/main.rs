//! OpenSASE Upload Gate - Main Entry Point

use opensase_upload_gate::{api, GateConfig, UploadGate};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE Upload Gate v{}", env!("CARGO_PKG_VERSION"));

    // Service settings only; the admission policy is loaded per upload
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/opensase/upload-gate.json".into());

    let config = GateConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config not loaded from {} ({}), using defaults", config_path, e);
        GateConfig::default()
    });

    let gate = Arc::new(UploadGate::new(config));
    gate.init().await?;

    api::start_server(gate).await?;

    Ok(())
}
