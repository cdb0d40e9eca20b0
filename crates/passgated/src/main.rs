use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{VerifierService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("passgated starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        data = %config.data_dir.display(),
        threshold = config.face_threshold.value(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config).context("failed to start verification engine")?;
    let service = VerifierService::new(engine, config.clone());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME}"))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "passgated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("passgated shutting down");

    Ok(())
}
