//! Face extractor contract.
//!
//! Detection and embedding models live behind [`FaceExtractor`]; the core only
//! sees detected regions and their vectors. One production backend is
//! available behind the `dlib` feature; tests supply their own doubles.

#[cfg(feature = "dlib")]
pub mod dlib;

use crate::types::{FaceRegion, Signature, SignatureFormat};
use chrono::Utc;
use thiserror::Error;

#[cfg(feature = "dlib")]
pub use dlib::{DlibExtractor, DlibModelPaths};

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: String, message: String },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// One face found in an image, with the vector derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub vector: Vec<f64>,
}

impl DetectedFace {
    /// Wrap this face as a signature in `format`, stamped now.
    pub fn into_signature(
        self,
        identity_key: &str,
        format: &SignatureFormat,
        tolerance: f64,
    ) -> Signature {
        Signature {
            identity_key: identity_key.to_string(),
            vector: self.vector,
            face_region: self.region,
            created_at: Utc::now(),
            tolerance_at_enrollment: tolerance,
            format_version: format.version.clone(),
        }
    }
}

/// Turns image bytes into zero or more detected faces.
///
/// Implementations must return an empty list (not an error) when no face is
/// found, and every vector must have the length declared by [`format`].
///
/// [`format`]: FaceExtractor::format
pub trait FaceExtractor: Send {
    /// Signature scheme this extractor produces.
    fn format(&self) -> &SignatureFormat;

    fn detect_and_encode(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError>;
}

impl<E: FaceExtractor + ?Sized> FaceExtractor for Box<E> {
    fn format(&self) -> &SignatureFormat {
        (**self).format()
    }

    fn detect_and_encode(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError> {
        (**self).detect_and_encode(image)
    }
}
