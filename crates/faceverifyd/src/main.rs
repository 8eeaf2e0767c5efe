use anyhow::{Context, Result};
use faceverify_io::{HttpReferenceStore, ReplaySource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod session;

use config::Config;
use dbus_interface::{VerifierService, BUS_NAME, OBJECT_PATH};
use engine::EngineSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceverifyd starting");

    let config = Config::load()?;
    tracing::info!(
        api = %config.api_base_url,
        threshold = config.match_threshold,
        policy = %config.match_policy,
        poll_ms = config.poll_interval.as_millis() as u64,
        replay = %config.capture_replay.display(),
        "configuration loaded"
    );

    let store = Arc::new(HttpReferenceStore::new(
        &config.api_base_url,
        config.fetch_timeout,
    )?);
    let source = Box::new(ReplaySource::open(&config.capture_replay, config.capture_loop));

    let engine = engine::spawn_engine(
        EngineSettings {
            threshold: config.match_threshold,
            policy: config.match_policy,
            poll_interval: config.poll_interval,
        },
        store,
        source,
    )?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VerifierService::new(engine))?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the bus"))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "faceverifyd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceverifyd shutting down");

    Ok(())
}
