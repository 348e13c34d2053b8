//! dlib-backed extractor: HOG face detector, 68-point landmark predictor and
//! the ResNet face encoder, producing 128-dim vectors.

use super::{DetectedFace, ExtractionError, FaceExtractor};
use crate::types::{FaceRegion, SignatureFormat};
use dlib_face_recognition::{
    FaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait, ImageMatrix,
    LandmarkPredictor, LandmarkPredictorTrait,
};
use std::path::{Path, PathBuf};

pub const DLIB_FORMAT_VERSION: &str = "dlib-resnet-v1";
pub const DLIB_EMBEDDING_DIM: usize = 128;

#[derive(Debug, Clone)]
pub struct DlibModelPaths {
    pub landmark: PathBuf,
    pub encoder: PathBuf,
}

pub struct DlibExtractor {
    detector: FaceDetector,
    predictor: LandmarkPredictor,
    encoder: FaceEncoderNetwork,
    format: SignatureFormat,
    jitters: u32,
}

impl DlibExtractor {
    /// Load both model files. Fails fast if either is missing.
    pub fn load(models: &DlibModelPaths, jitters: u32) -> Result<Self, ExtractionError> {
        let predictor = LandmarkPredictor::open(require(&models.landmark)?).map_err(|message| {
            ExtractionError::ModelLoad {
                path: models.landmark.display().to_string(),
                message,
            }
        })?;
        let encoder = FaceEncoderNetwork::open(require(&models.encoder)?).map_err(|message| {
            ExtractionError::ModelLoad {
                path: models.encoder.display().to_string(),
                message,
            }
        })?;

        tracing::info!(
            landmark = %models.landmark.display(),
            encoder = %models.encoder.display(),
            jitters,
            "loaded dlib face models"
        );

        Ok(Self {
            detector: FaceDetector::new(),
            predictor,
            encoder,
            format: SignatureFormat::new(DLIB_FORMAT_VERSION, DLIB_EMBEDDING_DIM),
            jitters,
        })
    }
}

fn require(path: &Path) -> Result<&Path, ExtractionError> {
    if path.exists() {
        Ok(path)
    } else {
        Err(ExtractionError::ModelNotFound(path.display().to_string()))
    }
}

impl FaceExtractor for DlibExtractor {
    fn format(&self) -> &SignatureFormat {
        &self.format
    }

    fn detect_and_encode(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError> {
        let rgb = image::load_from_memory(image)
            .map_err(|e| ExtractionError::Decode(e.to_string()))?
            .to_rgb8();
        let matrix = ImageMatrix::from_image(&rgb);

        let locations = self.detector.face_locations(&matrix);
        if locations.is_empty() {
            return Ok(Vec::new());
        }

        let landmarks: Vec<_> = locations
            .iter()
            .map(|rect| self.predictor.face_landmarks(&matrix, rect))
            .collect();
        let encodings = self
            .encoder
            .get_face_encodings(&matrix, &landmarks, self.jitters);

        if encodings.len() != locations.len() {
            return Err(ExtractionError::Failed(format!(
                "{} faces located but {} encoded",
                locations.len(),
                encodings.len()
            )));
        }

        Ok(locations
            .iter()
            .zip(encodings.iter())
            .map(|(rect, encoding)| DetectedFace {
                region: FaceRegion {
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                    left: rect.left,
                },
                vector: encoding.as_ref().to_vec(),
            })
            .collect())
    }
}
