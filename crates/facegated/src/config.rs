use crate::mode::Mode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `FACEGATE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device used for user-facing capture (face mode).
    pub user_camera: String,
    /// V4L2 device used for environment-facing capture (QR mode).
    pub environment_camera: String,
    /// Path to the SCRFD face detection ONNX model.
    pub detector_model_path: PathBuf,
    /// Path to the face embedding ONNX model.
    pub model_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance accepted as a positive match.
    pub match_threshold: f32,
    /// Interval between detection ticks.
    pub poll_interval_ms: u64,
    /// Number of warmup frames to discard after opening a camera.
    pub warmup_frames: usize,
    /// Mode the session starts in.
    pub initial_mode: Mode,
    /// Start capturing as soon as the gallery is loaded.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            user_camera: "/dev/video0".to_string(),
            environment_camera: "/dev/video2".to_string(),
            detector_model_path: data_dir.join("models").join("det_10g.onnx"),
            model_path: data_dir.join("models").join("face_embedding.onnx"),
            db_path: data_dir.join("faces.db"),
            match_threshold: facegate_core::DEFAULT_MATCH_THRESHOLD,
            poll_interval_ms: 100,
            warmup_frames: 4,
            initial_mode: Mode::Face,
            autostart: true,
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"));

        let mut config = if path.exists() {
            let config = Self::from_file(&path)?;
            tracing::info!(path = %path.display(), "loaded config file");
            config
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `FACEGATE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACEGATE_USER_CAMERA") {
            self.user_camera = v;
        }
        if let Some(v) = var("FACEGATE_ENVIRONMENT_CAMERA") {
            self.environment_camera = v;
        }
        if let Some(v) = var("FACEGATE_DETECTOR_MODEL_PATH") {
            self.detector_model_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGATE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        parse_into(&var, "FACEGATE_MATCH_THRESHOLD", &mut self.match_threshold);
        parse_into(&var, "FACEGATE_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        parse_into(&var, "FACEGATE_WARMUP_FRAMES", &mut self.warmup_frames);
        parse_into(&var, "FACEGATE_INITIAL_MODE", &mut self.initial_mode);
        if let Some(v) = var("FACEGATE_AUTOSTART") {
            self.autostart = v != "0";
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn parse_into<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("facegate")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("facegate")
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}
