//! Enrollment workflow.
//!
//! `Received → Validated → ExtractedOneFace → Stored → Complete`, with
//! `Rejected(reason)` reachable from every transition. Each transition is its
//! own method so the rejection and rollback paths can be driven one by one.

use crate::extractor::FaceExtractor;
use crate::image_check::{extension_for, inspect_image, ImageInfo, ImageRejection};
use crate::service::{ServiceConfig, ServiceError};
use crate::store::{SignatureStore, StagedArtifact};
use crate::types::Signature;
use serde::Serialize;
use thiserror::Error;

/// Whether the workflow creates a new enrollment or swaps an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollMode {
    Enroll,
    Replace,
}

/// Why an enrollment did not complete. These are caller-facing outcomes,
/// not internal failures.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EnrollmentRejection {
    #[error("invalid image: {0}")]
    InvalidImage(ImageRejection),
    #[error("no face detected")]
    NoFace,
    #[error("{count} faces detected; exactly one is required")]
    MultipleFaces { count: usize },
    #[error("face is {width}x{height}px, below the {min}px minimum")]
    FaceTooSmall { width: i64, height: i64, min: u32 },
    #[error("face encoding failed: {message}")]
    EncodingFailed { message: String },
    #[error("identity is already enrolled")]
    AlreadyRegistered,
    #[error("identity is not enrolled")]
    NotRegistered,
}

impl EnrollmentRejection {
    pub fn code(&self) -> &'static str {
        match self {
            EnrollmentRejection::InvalidImage(_) => "invalid_image",
            EnrollmentRejection::NoFace => "no_face",
            EnrollmentRejection::MultipleFaces { .. } => "multiple_faces",
            EnrollmentRejection::FaceTooSmall { .. } => "face_too_small",
            EnrollmentRejection::EncodingFailed { .. } => "encoding_failed",
            EnrollmentRejection::AlreadyRegistered => "already_registered",
            EnrollmentRejection::NotRegistered => "not_registered",
        }
    }
}

#[derive(Debug)]
pub enum EnrollmentState<'a> {
    Received {
        identity_key: &'a str,
        image: &'a [u8],
    },
    Validated {
        identity_key: &'a str,
        image: &'a [u8],
        info: ImageInfo,
    },
    ExtractedOneFace {
        image: &'a [u8],
        info: ImageInfo,
        signature: Signature,
    },
    Stored {
        signature: Signature,
        artifact: StagedArtifact,
    },
    Complete {
        signature: Signature,
    },
    Rejected(EnrollmentRejection),
}

impl EnrollmentState<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            EnrollmentState::Received { .. } => "received",
            EnrollmentState::Validated { .. } => "validated",
            EnrollmentState::ExtractedOneFace { .. } => "extracted_one_face",
            EnrollmentState::Stored { .. } => "stored",
            EnrollmentState::Complete { .. } => "complete",
            EnrollmentState::Rejected(_) => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentState::Complete { .. } | EnrollmentState::Rejected(_)
        )
    }
}

/// Caller-facing result of `enroll` / `replace`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentResult {
    pub success: bool,
    pub message: String,
    pub reason: Option<EnrollmentRejection>,
}

impl EnrollmentResult {
    fn completed(mode: EnrollMode, identity_key: &str) -> Self {
        let message = match mode {
            EnrollMode::Enroll => format!("enrolled {identity_key}"),
            EnrollMode::Replace => format!("replaced enrollment for {identity_key}"),
        };
        Self {
            success: true,
            message,
            reason: None,
        }
    }

    fn rejected(reason: EnrollmentRejection) -> Self {
        Self {
            success: false,
            message: reason.to_string(),
            reason: Some(reason),
        }
    }
}

/// One enrollment attempt, borrowing the collaborators it drives.
pub struct Enrollment<'c, E: ?Sized, S: ?Sized> {
    pub mode: EnrollMode,
    pub extractor: &'c mut E,
    pub store: &'c S,
    pub config: &'c ServiceConfig,
}

impl<'c, E, S> Enrollment<'c, E, S>
where
    E: FaceExtractor + ?Sized,
    S: SignatureStore + ?Sized,
{
    /// Drive the state machine from `Received` to a terminal state.
    pub fn run(
        &mut self,
        identity_key: &str,
        image: &[u8],
    ) -> Result<EnrollmentResult, ServiceError> {
        let mut state = EnrollmentState::Received {
            identity_key,
            image,
        };
        while !state.is_terminal() {
            state = self.advance(state)?;
            tracing::debug!(
                identity_key,
                mode = ?self.mode,
                state = state.name(),
                "enrollment transition"
            );
        }

        Ok(match state {
            EnrollmentState::Rejected(reason) => {
                tracing::info!(
                    identity_key,
                    mode = ?self.mode,
                    reason = reason.code(),
                    "enrollment rejected"
                );
                EnrollmentResult::rejected(reason)
            }
            _ => {
                tracing::info!(identity_key, mode = ?self.mode, "enrollment complete");
                EnrollmentResult::completed(self.mode, identity_key)
            }
        })
    }

    pub fn advance<'a>(
        &mut self,
        state: EnrollmentState<'a>,
    ) -> Result<EnrollmentState<'a>, ServiceError> {
        match state {
            EnrollmentState::Received {
                identity_key,
                image,
            } => Ok(self.validate(identity_key, image)),
            EnrollmentState::Validated {
                identity_key,
                image,
                info,
            } => Ok(self.extract(identity_key, image, info)),
            EnrollmentState::ExtractedOneFace {
                image,
                info,
                signature,
            } => self.store(image, info, signature),
            EnrollmentState::Stored {
                signature,
                artifact,
            } => Ok(self.complete(signature, artifact)),
            terminal => Ok(terminal),
        }
    }

    /// `Received → Validated`: byte size, format, full decode, pixel size.
    pub fn validate<'a>(&self, identity_key: &'a str, image: &'a [u8]) -> EnrollmentState<'a> {
        match inspect_image(image, &self.config.image_limits()) {
            Ok(info) => EnrollmentState::Validated {
                identity_key,
                image,
                info,
            },
            Err(rejection) => {
                EnrollmentState::Rejected(EnrollmentRejection::InvalidImage(rejection))
            }
        }
    }

    /// `Validated → ExtractedOneFace`: exactly one face, large enough, with a
    /// vector in the extractor's declared format.
    pub fn extract<'a>(
        &mut self,
        identity_key: &str,
        image: &'a [u8],
        info: ImageInfo,
    ) -> EnrollmentState<'a> {
        let faces = match self.extractor.detect_and_encode(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(identity_key, error = %e, "extractor failed during enrollment");
                return EnrollmentState::Rejected(EnrollmentRejection::EncodingFailed {
                    message: e.to_string(),
                });
            }
        };

        let mut faces = faces;
        if faces.len() > 1 {
            return EnrollmentState::Rejected(EnrollmentRejection::MultipleFaces {
                count: faces.len(),
            });
        }
        let Some(face) = faces.pop() else {
            return EnrollmentState::Rejected(EnrollmentRejection::NoFace);
        };

        let min = self.config.min_face_px;
        if !face.region.meets_minimum(min) {
            return EnrollmentState::Rejected(EnrollmentRejection::FaceTooSmall {
                width: face.region.width(),
                height: face.region.height(),
                min,
            });
        }

        let format = self.extractor.format().clone();
        let signature = face.into_signature(identity_key, &format, self.config.tolerance);
        if let Err(e) = signature.validate(&format) {
            tracing::warn!(identity_key, error = %e, "extractor produced a malformed vector");
            return EnrollmentState::Rejected(EnrollmentRejection::EncodingFailed {
                message: e.to_string(),
            });
        }

        EnrollmentState::ExtractedOneFace {
            image,
            info,
            signature,
        }
    }

    /// `ExtractedOneFace → Stored`: registration check, stage the artifact,
    /// then commit the record. A failed commit discards the staged artifact.
    pub fn store<'a>(
        &mut self,
        image: &'a [u8],
        info: ImageInfo,
        signature: Signature,
    ) -> Result<EnrollmentState<'a>, ServiceError> {
        let key = signature.identity_key.as_str();
        let exists = self.store.exists(key)?;
        match (self.mode, exists) {
            (EnrollMode::Enroll, true) => {
                return Ok(EnrollmentState::Rejected(
                    EnrollmentRejection::AlreadyRegistered,
                ))
            }
            (EnrollMode::Replace, false) => {
                return Ok(EnrollmentState::Rejected(EnrollmentRejection::NotRegistered))
            }
            _ => {}
        }

        let artifact = self
            .store
            .stage_artifact(key, image, extension_for(info.format))?;

        if let Err(put_err) = self.store.put(&signature, &artifact) {
            tracing::error!(
                identity_key = key,
                error = %put_err,
                "storing signature failed; discarding staged artifact"
            );
            if let Err(discard_err) = self.store.discard_artifact(&artifact) {
                return Err(ServiceError::StoreInconsistency {
                    key: key.to_string(),
                    source: discard_err,
                });
            }
            return Err(put_err.into());
        }

        Ok(EnrollmentState::Stored {
            signature,
            artifact,
        })
    }

    /// `Stored → Complete`.
    pub fn complete<'a>(
        &self,
        signature: Signature,
        artifact: StagedArtifact,
    ) -> EnrollmentState<'a> {
        tracing::debug!(
            identity_key = %signature.identity_key,
            artifact = %artifact.file_name,
            sha256 = %artifact.sha256,
            "enrollment artifact committed"
        );
        EnrollmentState::Complete { signature }
    }
}
