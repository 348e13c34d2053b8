//! Verification workflow: compare a fresh face against the enrolled signature.

use crate::extractor::FaceExtractor;
use crate::image_check::{inspect_image, ImageRejection};
use crate::matcher::{round_to, ConfidenceTier, Matcher};
use crate::service::{ServiceConfig, ServiceError};
use crate::store::{SignatureStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VerificationRejection {
    #[error("identity is not enrolled")]
    NotRegistered,
    #[error("invalid image: {0}")]
    InvalidImage(ImageRejection),
    #[error("no face detected")]
    NoFace,
    #[error("face encoding failed: {message}")]
    EncodingFailed { message: String },
}

impl VerificationRejection {
    pub fn code(&self) -> &'static str {
        match self {
            VerificationRejection::NotRegistered => "not_registered",
            VerificationRejection::InvalidImage(_) => "invalid_image",
            VerificationRejection::NoFace => "no_face",
            VerificationRejection::EncodingFailed { .. } => "encoding_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    /// `round(similarity * 100, 2)` from the unrounded similarity.
    pub similarity_pct: f64,
    pub confidence: ConfidenceTier,
    pub timestamp: DateTime<Utc>,
    pub distance: f64,
    pub tolerance_used: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Completed(VerificationResult),
    Rejected(VerificationRejection),
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Completed(r) if r.verified)
    }
}

/// Run one verification of `image` against the signature enrolled for
/// `identity_key`.
///
/// Nothing is extracted or compared for an unknown key. A stored signature
/// from another extractor scheme is an error, never coerced.
pub fn verify<E, S, M>(
    extractor: &mut E,
    store: &S,
    matcher: &M,
    config: &ServiceConfig,
    identity_key: &str,
    image: &[u8],
) -> Result<VerificationOutcome, ServiceError>
where
    E: FaceExtractor + ?Sized,
    S: SignatureStore + ?Sized,
    M: Matcher + ?Sized,
{
    if !store.exists(identity_key)? {
        tracing::info!(identity_key, "verification for unenrolled identity");
        return Ok(VerificationOutcome::Rejected(
            VerificationRejection::NotRegistered,
        ));
    }

    if let Err(rejection) = inspect_image(image, &config.image_limits()) {
        tracing::info!(identity_key, error = %rejection, "verification image rejected");
        return Ok(VerificationOutcome::Rejected(
            VerificationRejection::InvalidImage(rejection),
        ));
    }

    let faces = match extractor.detect_and_encode(image) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!(identity_key, error = %e, "extractor failed during verification");
            return Ok(VerificationOutcome::Rejected(
                VerificationRejection::EncodingFailed {
                    message: e.to_string(),
                },
            ));
        }
    };
    let face_count = faces.len();
    // Several faces: take the largest, the person closest to the terminal.
    let Some(face) = faces.into_iter().max_by_key(|f| f.region.area()) else {
        return Ok(VerificationOutcome::Rejected(VerificationRejection::NoFace));
    };
    if face_count > 1 {
        tracing::info!(identity_key, face_count, "multiple faces; comparing the largest");
    }

    let format = extractor.format().clone();
    let candidate = face.into_signature(identity_key, &format, config.tolerance);
    if let Err(e) = candidate.validate(&format) {
        tracing::warn!(identity_key, error = %e, "extractor produced a malformed vector");
        return Ok(VerificationOutcome::Rejected(
            VerificationRejection::EncodingFailed {
                message: e.to_string(),
            },
        ));
    }

    let reference = match store.get(identity_key) {
        Ok(sig) => sig,
        // Removed between the existence check and now.
        Err(StoreError::NotFound(_)) => {
            return Ok(VerificationOutcome::Rejected(
                VerificationRejection::NotRegistered,
            ))
        }
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = reference.validate(&format) {
        tracing::warn!(identity_key, error = %e, "stored signature predates the current extractor");
        return Err(ServiceError::IncompatibleSignatures {
            key: identity_key.to_string(),
            reason: e.to_string(),
        });
    }

    let result = matcher.compare(&reference, &candidate, config.tolerance)?;
    tracing::info!(
        identity_key,
        distance = result.distance,
        similarity = result.similarity,
        verified = result.is_match,
        confidence = %result.confidence,
        "verification complete"
    );

    Ok(VerificationOutcome::Completed(VerificationResult {
        verified: result.is_match,
        similarity_pct: round_to(result.exact_similarity * 100.0, 2),
        confidence: result.confidence,
        timestamp: Utc::now(),
        distance: result.distance,
        tolerance_used: result.tolerance_used,
    }))
}
