use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identity key accepted from callers.
pub const MAX_IDENTITY_KEY_LEN: usize = 128;

/// Pixel bounding box of a detected face, `(top, right, bottom, left)`.
///
/// Kept for audit and debugging; never used in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
}

impl FaceRegion {
    pub fn width(&self) -> i64 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    /// True when both sides are at least `min_px` pixels.
    pub fn meets_minimum(&self, min_px: u32) -> bool {
        self.width() >= i64::from(min_px) && self.height() >= i64::from(min_px)
    }
}

/// Signature scheme declared by an extractor: a version tag and the vector
/// length every signature of that version must have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFormat {
    pub version: String,
    pub dimension: usize,
}

impl SignatureFormat {
    pub fn new(version: impl Into<String>, dimension: usize) -> Self {
        Self {
            version: version.into(),
            dimension,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignatureError {
    #[error("signature vector is empty")]
    Empty,
    #[error("signature has no format version")]
    MissingVersion,
    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("format {version} requires {expected}-dim vectors, got {actual}")]
    DimensionMismatch {
        version: String,
        expected: usize,
        actual: usize,
    },
    #[error("vector component {index} is not finite")]
    NonFinite { index: usize },
}

/// One enrolled face: the embedding plus the metadata it was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub identity_key: String,
    /// Embedding components. Order is significant; held in f64 so distance
    /// accumulation never loses precision to the storage type.
    pub vector: Vec<f64>,
    pub face_region: FaceRegion,
    pub created_at: DateTime<Utc>,
    pub tolerance_at_enrollment: f64,
    /// Extractor scheme that produced `vector` (e.g., "dlib-resnet-v1").
    pub format_version: String,
}

impl Signature {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Check this signature against the scheme the running extractor declares.
    ///
    /// A signature that fails here must be re-enrolled; it is never compared.
    pub fn validate(&self, format: &SignatureFormat) -> Result<(), SignatureError> {
        self.check_shape()?;
        if self.format_version != format.version {
            return Err(SignatureError::VersionMismatch {
                expected: format.version.clone(),
                found: self.format_version.clone(),
            });
        }
        if self.vector.len() != format.dimension {
            return Err(SignatureError::DimensionMismatch {
                version: format.version.clone(),
                expected: format.dimension,
                actual: self.vector.len(),
            });
        }
        Ok(())
    }

    /// Structural checks that need no format: non-empty, versioned, finite.
    pub(crate) fn check_shape(&self) -> Result<(), SignatureError> {
        if self.format_version.is_empty() {
            return Err(SignatureError::MissingVersion);
        }
        if self.vector.is_empty() {
            return Err(SignatureError::Empty);
        }
        if let Some(index) = self.vector.iter().position(|v| !v.is_finite()) {
            return Err(SignatureError::NonFinite { index });
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityKeyError {
    #[error("identity key is empty")]
    Empty,
    #[error("identity key exceeds {MAX_IDENTITY_KEY_LEN} characters")]
    TooLong,
    #[error("identity key contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// Identity keys are opaque, but must be printable and path-safe.
pub fn validate_identity_key(key: &str) -> Result<(), IdentityKeyError> {
    if key.trim().is_empty() {
        return Err(IdentityKeyError::Empty);
    }
    if key.chars().count() > MAX_IDENTITY_KEY_LEN {
        return Err(IdentityKeyError::TooLong);
    }
    if let Some(c) = key
        .chars()
        .find(|c| c.is_control() || *c == '/' || *c == '\\')
    {
        return Err(IdentityKeyError::ForbiddenChar(c));
    }
    Ok(())
}
