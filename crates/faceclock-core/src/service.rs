//! Facade tying extractor, store and matcher together behind the
//! enroll / replace / verify / status / remove / statistics operations.

use crate::enrollment::{EnrollMode, Enrollment, EnrollmentResult};
use crate::extractor::FaceExtractor;
use crate::image_check::{ImageLimits, DEFAULT_MAX_IMAGE_BYTES, DEFAULT_MIN_IMAGE_BYTES};
use crate::matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_TOLERANCE};
use crate::store::{SignatureStore, StoreError, StoreStatistics};
use crate::types::{validate_identity_key, IdentityKeyError, SignatureFormat};
use crate::verification::{self, VerificationOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MIN_FACE_PX: u32 = 50;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid identity key: {0}")]
    InvalidIdentityKey(#[from] IdentityKeyError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("re-enrollment required for {key}: {reason}")]
    IncompatibleSignatures { key: String, reason: String },
    #[error("store left inconsistent for {key}: staged artifact could not be discarded: {source}")]
    StoreInconsistency {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl ServiceError {
    /// True when the caller sent something unusable, as opposed to a fault
    /// on this side.
    pub fn is_input_error(&self) -> bool {
        matches!(self, ServiceError::InvalidIdentityKey(_))
    }
}

/// Tunables the workflows need, validated once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Maximum distance accepted as the same person.
    pub tolerance: f64,
    /// Minimum face width and height, in pixels.
    pub min_face_px: u32,
    pub min_image_bytes: usize,
    pub max_image_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            min_face_px: DEFAULT_MIN_FACE_PX,
            min_image_bytes: DEFAULT_MIN_IMAGE_BYTES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if !(0.0..=1.0).contains(&self.tolerance) {
            return Err(ServiceError::InvalidConfig(format!(
                "tolerance must be within [0, 1], got {}",
                self.tolerance
            )));
        }
        if self.min_image_bytes > self.max_image_bytes {
            return Err(ServiceError::InvalidConfig(format!(
                "min image bytes ({}) exceeds max image bytes ({})",
                self.min_image_bytes, self.max_image_bytes
            )));
        }
        Ok(())
    }

    pub fn image_limits(&self) -> ImageLimits {
        ImageLimits {
            min_bytes: self.min_image_bytes,
            max_bytes: self.max_image_bytes,
            min_dimension: self.min_face_px,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub identity_key: String,
    pub has_signature: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub identity_key: String,
    pub removed: bool,
}

/// Whether `identity_key` has a usable enrollment. Needs only the store.
pub fn status<S: SignatureStore + ?Sized>(
    store: &S,
    identity_key: &str,
) -> Result<StatusReport, ServiceError> {
    validate_identity_key(identity_key)?;
    Ok(StatusReport {
        identity_key: identity_key.to_string(),
        has_signature: store.exists(identity_key)?,
    })
}

/// Delete the enrollment for `identity_key`, if any.
pub fn remove<S: SignatureStore + ?Sized>(
    store: &S,
    identity_key: &str,
) -> Result<RemovalReport, ServiceError> {
    validate_identity_key(identity_key)?;
    let removed = store.delete(identity_key)?;
    tracing::info!(identity_key, removed, "remove requested");
    Ok(RemovalReport {
        identity_key: identity_key.to_string(),
        removed,
    })
}

pub fn statistics<S: SignatureStore + ?Sized>(store: &S) -> Result<StoreStatistics, ServiceError> {
    Ok(store.statistics()?)
}

/// Face identity operations over one extractor and one shared store.
///
/// Enrollment and verification need `&mut self` because extractors carry
/// model state; the store is shared so read-only callers can bypass the
/// service entirely.
pub struct FaceIdentityService<E, S, M = EuclideanMatcher> {
    extractor: E,
    store: Arc<S>,
    matcher: M,
    config: ServiceConfig,
}

impl<E, S> FaceIdentityService<E, S, EuclideanMatcher>
where
    E: FaceExtractor,
    S: SignatureStore,
{
    pub fn new(extractor: E, store: Arc<S>, config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::with_matcher(extractor, store, EuclideanMatcher, config)
    }
}

impl<E, S, M> FaceIdentityService<E, S, M>
where
    E: FaceExtractor,
    S: SignatureStore,
    M: Matcher,
{
    pub fn with_matcher(
        extractor: E,
        store: Arc<S>,
        matcher: M,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        tracing::info!(
            format = %extractor.format().version,
            dimension = extractor.format().dimension,
            tolerance = config.tolerance,
            min_face_px = config.min_face_px,
            "face identity service ready"
        );
        Ok(Self {
            extractor,
            store,
            matcher,
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn format(&self) -> &SignatureFormat {
        self.extractor.format()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create the first enrollment for `identity_key`.
    pub fn enroll(
        &mut self,
        identity_key: &str,
        image: &[u8],
    ) -> Result<EnrollmentResult, ServiceError> {
        self.run_enrollment(EnrollMode::Enroll, identity_key, image)
    }

    /// Swap the enrollment for `identity_key`; the old one survives any failure.
    pub fn replace(
        &mut self,
        identity_key: &str,
        image: &[u8],
    ) -> Result<EnrollmentResult, ServiceError> {
        self.run_enrollment(EnrollMode::Replace, identity_key, image)
    }

    fn run_enrollment(
        &mut self,
        mode: EnrollMode,
        identity_key: &str,
        image: &[u8],
    ) -> Result<EnrollmentResult, ServiceError> {
        validate_identity_key(identity_key)?;
        Enrollment {
            mode,
            extractor: &mut self.extractor,
            store: self.store.as_ref(),
            config: &self.config,
        }
        .run(identity_key, image)
    }

    pub fn verify(
        &mut self,
        identity_key: &str,
        image: &[u8],
    ) -> Result<VerificationOutcome, ServiceError> {
        validate_identity_key(identity_key)?;
        verification::verify(
            &mut self.extractor,
            self.store.as_ref(),
            &self.matcher,
            &self.config,
            identity_key,
            image,
        )
    }

    pub fn status(&self, identity_key: &str) -> Result<StatusReport, ServiceError> {
        status(self.store.as_ref(), identity_key)
    }

    pub fn remove(&self, identity_key: &str) -> Result<RemovalReport, ServiceError> {
        remove(self.store.as_ref(), identity_key)
    }

    pub fn statistics(&self) -> Result<StoreStatistics, ServiceError> {
        statistics(self.store.as_ref())
    }
}
