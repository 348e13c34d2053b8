use faceclock_core::image_check::{DEFAULT_MAX_IMAGE_BYTES, DEFAULT_MIN_IMAGE_BYTES};
use faceclock_core::matcher::DEFAULT_TOLERANCE;
use faceclock_core::service::DEFAULT_MIN_FACE_PX;
use faceclock_core::ServiceConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_MODEL_DIR: &str = "/usr/share/faceclock/models";
const LANDMARK_MODEL_FILE: &str = "shape_predictor_68_face_landmarks.dat";
const ENCODER_MODEL_FILE: &str = "dlib_face_recognition_resnet_model_v1.dat";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Optional TOML file; every key may be overridden by its environment variable.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    tolerance: Option<f64>,
    min_face_px: Option<u32>,
    min_image_bytes: Option<usize>,
    max_image_bytes: Option<usize>,
    data_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    landmark_model: Option<PathBuf>,
    encoder_model: Option<PathBuf>,
    encoding_jitters: Option<u32>,
    session_bus: Option<bool>,
}

/// Daemon configuration, loaded from `FACECLOCK_*` environment variables
/// layered over an optional TOML file named by `FACECLOCK_CONFIG`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Matching and admission limits handed to the core.
    pub service: ServiceConfig,
    /// Directory holding the signature database and enrollment artifacts.
    pub data_dir: PathBuf,
    pub landmark_model: PathBuf,
    pub encoder_model: PathBuf,
    /// Re-sampling passes per encoding (dlib "jitters"); 0 is fastest.
    pub encoding_jitters: u32,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match lookup("FACECLOCK_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let service = ServiceConfig {
            tolerance: env_or(&lookup, "FACECLOCK_TOLERANCE", file.tolerance, DEFAULT_TOLERANCE)?,
            min_face_px: env_or(
                &lookup,
                "FACECLOCK_MIN_FACE_PX",
                file.min_face_px,
                DEFAULT_MIN_FACE_PX,
            )?,
            min_image_bytes: env_or(
                &lookup,
                "FACECLOCK_MIN_IMAGE_BYTES",
                file.min_image_bytes,
                DEFAULT_MIN_IMAGE_BYTES,
            )?,
            max_image_bytes: env_or(
                &lookup,
                "FACECLOCK_MAX_IMAGE_BYTES",
                file.max_image_bytes,
                DEFAULT_MAX_IMAGE_BYTES,
            )?,
        };
        service
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let data_dir = lookup("FACECLOCK_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&lookup));

        let model_dir = lookup("FACECLOCK_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_DIR));

        let landmark_model = lookup("FACECLOCK_LANDMARK_MODEL")
            .map(PathBuf::from)
            .or(file.landmark_model)
            .unwrap_or_else(|| model_dir.join(LANDMARK_MODEL_FILE));

        let encoder_model = lookup("FACECLOCK_ENCODER_MODEL")
            .map(PathBuf::from)
            .or(file.encoder_model)
            .unwrap_or_else(|| model_dir.join(ENCODER_MODEL_FILE));

        let session_bus = match lookup("FACECLOCK_SESSION_BUS") {
            Some(v) => v != "0" && !v.eq_ignore_ascii_case("false"),
            None => file.session_bus.unwrap_or(false),
        };

        Ok(Self {
            service,
            data_dir,
            landmark_model,
            encoder_model,
            encoding_jitters: env_or(
                &lookup,
                "FACECLOCK_ENCODING_JITTERS",
                file.encoding_jitters,
                0,
            )?,
            session_bus,
        })
    }
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn default_data_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceclock")
}

/// Environment value if set, else the file value, else `default`.
fn env_or<T, F>(
    lookup: &F,
    key: &'static str,
    file: Option<T>,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(file.unwrap_or(default)),
    }
}
