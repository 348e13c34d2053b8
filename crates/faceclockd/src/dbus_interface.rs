use crate::engine::{EngineError, EngineHandle};
use faceclock_core::service;
use faceclock_core::types::SignatureFormat;
use faceclock_core::{ServiceConfig, ServiceError, SignatureStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceclock.Attendance1";
pub const OBJECT_PATH: &str = "/org/faceclock/Attendance1";

/// D-Bus interface for the faceclock attendance daemon.
///
/// Bus name: org.faceclock.Attendance1
/// Object path: /org/faceclock/Attendance1
///
/// Every method returns a JSON document. Enrollment and verification go
/// through the engine thread; status, removal and statistics read the store
/// directly on the blocking pool.
pub struct AttendanceService {
    engine: EngineHandle,
    store: Arc<dyn SignatureStore>,
    format: SignatureFormat,
    config: ServiceConfig,
    started: Instant,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<dyn SignatureStore>,
        format: SignatureFormat,
        config: ServiceConfig,
    ) -> Self {
        Self {
            engine,
            store,
            format,
            config,
            started: Instant::now(),
        }
    }

    async fn with_store<T, F>(&self, op: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SignatureStore) -> Result<T, ServiceError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "store task panicked");
                internal_error()
            })?
            .map_err(|e| map_error(EngineError::Service(e)))
    }
}

#[interface(name = "org.faceclock.Attendance1")]
impl AttendanceService {
    /// Enroll the face in `image` as the first signature for `identity_key`.
    async fn enroll(&self, identity_key: String, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity_key = %identity_key, bytes = image.len(), "enroll requested");
        let result = self.engine.enroll(identity_key, image).await.map_err(map_error)?;
        to_json(&result)
    }

    /// Replace the signature for `identity_key`; the old one survives a failure.
    async fn replace(&self, identity_key: String, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity_key = %identity_key, bytes = image.len(), "replace requested");
        let result = self.engine.replace(identity_key, image).await.map_err(map_error)?;
        to_json(&result)
    }

    /// Verify the face in `image` against the signature for `identity_key`.
    async fn verify(&self, identity_key: String, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity_key = %identity_key, bytes = image.len(), "verify requested");
        let outcome = self.engine.verify(identity_key, image).await.map_err(map_error)?;
        to_json(&outcome)
    }

    async fn status(&self, identity_key: String) -> zbus::fdo::Result<String> {
        let report = self
            .with_store(move |store| service::status(store, &identity_key))
            .await?;
        to_json(&report)
    }

    async fn remove(&self, identity_key: String) -> zbus::fdo::Result<String> {
        let report = self
            .with_store(move |store| service::remove(store, &identity_key))
            .await?;
        to_json(&report)
    }

    async fn statistics(&self) -> zbus::fdo::Result<String> {
        let stats = self.with_store(|store| service::statistics(store)).await?;
        to_json(&stats)
    }

    /// Daemon liveness and the parameters it is running with.
    async fn health(&self) -> zbus::fdo::Result<String> {
        let stats = self.with_store(|store| service::statistics(store)).await?;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "format_version": self.format.version,
            "dimension": self.format.dimension,
            "tolerance": self.config.tolerance,
            "min_face_px": self.config.min_face_px,
            "enrolled": stats.total,
            "uptime_secs": self.started.elapsed().as_secs(),
        }))
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize reply");
        internal_error()
    })
}

fn internal_error() -> zbus::fdo::Error {
    zbus::fdo::Error::Failed("internal error".into())
}

/// Caller mistakes become `InvalidArgs`, stale enrollments a re-enrollment
/// hint, and everything else an opaque failure with the detail kept in the log.
pub(crate) fn map_error(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Service(e) if e.is_input_error() => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        EngineError::Service(ServiceError::IncompatibleSignatures { key, reason }) => {
            tracing::warn!(
                identity_key = %key,
                reason = %reason,
                "stored signature is incompatible"
            );
            zbus::fdo::Error::Failed(format!("re-enrollment required for {key}"))
        }
        other => {
            tracing::error!(error = %other, "request failed");
            internal_error()
        }
    }
}
