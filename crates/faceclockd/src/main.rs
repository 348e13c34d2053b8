use anyhow::{Context, Result};
use faceclock_core::{FaceExtractor, FaceIdentityService, SqliteSignatureStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceclockd starting");

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        tolerance = config.service.tolerance,
        min_face_px = config.service.min_face_px,
        max_image_bytes = config.service.max_image_bytes,
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = Arc::new(
        SqliteSignatureStore::open(&config.data_dir)
            .with_context(|| format!("opening signature store in {}", config.data_dir.display()))?,
    );

    let extractor = load_extractor(&config)?;
    let service = FaceIdentityService::new(extractor, Arc::clone(&store), config.service)?;
    let format = service.format().clone();
    let engine = engine::spawn_engine(service);

    let iface = AttendanceService::new(engine, store, format, config.service);
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the D-Bus"))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "faceclockd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("faceclockd shutting down");

    Ok(())
}

#[cfg(feature = "dlib")]
fn load_extractor(config: &Config) -> Result<Box<dyn FaceExtractor>> {
    use faceclock_core::extractor::{DlibExtractor, DlibModelPaths};

    let models = DlibModelPaths {
        landmark: config.landmark_model.clone(),
        encoder: config.encoder_model.clone(),
    };
    let extractor = DlibExtractor::load(&models, config.encoding_jitters)
        .context("loading dlib face models")?;
    Ok(Box::new(extractor))
}

#[cfg(not(feature = "dlib"))]
fn load_extractor(_config: &Config) -> Result<Box<dyn FaceExtractor>> {
    anyhow::bail!("faceclockd was built without a face extractor; rebuild with `--features dlib`")
}
