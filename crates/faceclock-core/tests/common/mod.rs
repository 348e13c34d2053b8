#![allow(dead_code)]

use faceclock_core::extractor::{DetectedFace, ExtractionError, FaceExtractor};
use faceclock_core::store::{
    SignatureStore, SqliteSignatureStore, StagedArtifact, StoreError, StoreStatistics,
};
use faceclock_core::types::{FaceRegion, Signature, SignatureFormat};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const DIM: usize = 128;
pub const FORMAT_VERSION: &str = "synthetic-v1";

/// PNG whose bytes differ per seed.
pub fn face_image(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(160, 160, |x, y| {
        Rgb([
            ((x * 3 + u32::from(seed) * 17) % 256) as u8,
            ((y * 5 + u32::from(seed) * 29) % 256) as u8,
            ((x * y + u32::from(seed)) % 256) as u8,
        ])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Deterministic 128-dim embedding for a synthetic person.
pub fn person_vector(person: u32) -> Vec<f64> {
    (0..DIM)
        .map(|i| ((i as f64 + 1.0) * 0.37).sin() * 0.1 + f64::from(person) * 0.1)
        .collect()
}

pub fn detected(person: u32, side: i64) -> DetectedFace {
    DetectedFace {
        region: FaceRegion { top: 10, right: 10 + side, bottom: 10 + side, left: 10 },
        vector: person_vector(person),
    }
}

/// Test double: replies are looked up by the exact image bytes; unknown
/// images contain no face. Counts every call.
pub struct ScriptedExtractor {
    format: SignatureFormat,
    replies: HashMap<Vec<u8>, Result<Vec<DetectedFace>, String>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::with_format(SignatureFormat::new(FORMAT_VERSION, DIM))
    }

    pub fn with_format(format: SignatureFormat) -> Self {
        Self {
            format,
            replies: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn faces(mut self, image: &[u8], faces: Vec<DetectedFace>) -> Self {
        self.replies.insert(image.to_vec(), Ok(faces));
        self
    }

    pub fn failure(mut self, image: &[u8], message: &str) -> Self {
        self.replies.insert(image.to_vec(), Err(message.to_string()));
        self
    }

    pub fn call_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl FaceExtractor for ScriptedExtractor {
    fn format(&self) -> &SignatureFormat {
        &self.format
    }

    fn detect_and_encode(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.get(image) {
            Some(Ok(faces)) => Ok(faces.clone()),
            Some(Err(message)) => Err(ExtractionError::Failed(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}

/// SQLite store whose `put` and `discard_artifact` can be made to fail.
pub struct FlakyStore {
    pub inner: SqliteSignatureStore,
    pub fail_put: AtomicBool,
    pub fail_discard: AtomicBool,
}

impl FlakyStore {
    pub fn open(root: &Path) -> Self {
        Self {
            inner: SqliteSignatureStore::open(root).unwrap(),
            fail_put: AtomicBool::new(false),
            fail_discard: AtomicBool::new(false),
        }
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Io {
            path: what.into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
        }
    }
}

impl SignatureStore for FlakyStore {
    fn stage_artifact(
        &self,
        key: &str,
        image: &[u8],
        ext: &str,
    ) -> Result<StagedArtifact, StoreError> {
        self.inner.stage_artifact(key, image, ext)
    }

    fn discard_artifact(&self, artifact: &StagedArtifact) -> Result<(), StoreError> {
        if self.fail_discard.load(Ordering::SeqCst) {
            return Err(Self::injected("discard"));
        }
        self.inner.discard_artifact(artifact)
    }

    fn put(&self, signature: &Signature, artifact: &StagedArtifact) -> Result<(), StoreError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(Self::injected("put"));
        }
        self.inner.put(signature, artifact)
    }

    fn get(&self, key: &str) -> Result<Signature, StoreError> {
        self.inner.get(key)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key)
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        self.inner.statistics()
    }
}

pub fn artifact_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
