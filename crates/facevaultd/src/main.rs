use anyhow::Result;
use facevault_store::BiometricStore;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::{Bus, Config};
use dbus_interface::{FaceVaultService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facevaultd starting");

    let config = Config::from_env()?;
    let store = BiometricStore::open(&config.store);
    tracing::info!(status = ?store.status(), "store opened");

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceVaultService::new(store.clone()))?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facevaultd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facevaultd shutting down");
    store.flush().await;

    Ok(())
}
