//! faceclock-core — face identity matching for time-and-attendance.
//!
//! Enrolls one face signature per identity key and verifies later captures
//! against it by Euclidean distance. Face detection and embedding sit behind
//! the [`FaceExtractor`] trait; signatures persist in SQLite.

pub mod enrollment;
pub mod extractor;
pub mod image_check;
pub mod matcher;
pub mod service;
pub mod store;
pub mod types;
pub mod verification;

pub use enrollment::{EnrollmentRejection, EnrollmentResult};
pub use extractor::{DetectedFace, ExtractionError, FaceExtractor};
pub use matcher::{ConfidenceTier, EuclideanMatcher, MatchResult, Matcher};
pub use service::{FaceIdentityService, ServiceConfig, ServiceError};
pub use store::{SignatureStore, SqliteSignatureStore, StoreError, StoreStatistics};
pub use types::{FaceRegion, Signature, SignatureFormat};
pub use verification::{VerificationOutcome, VerificationRejection, VerificationResult};
