use anyhow::{Context, Result};
use facelog_core::capture::{self, CaptureConfig};
use facelog_core::detector::{self, DetectParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File read when `FACELOG_CONFIG` is unset, if present.
const DEFAULT_CONFIG_FILE: &str = "facelog.toml";

/// Runtime configuration: built-in defaults, then an optional TOML file,
/// then `FACELOG_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// OpenCV Haar cascade XML used for detection.
    pub cascade_path: PathBuf,
    /// Base directory holding one folder per enrollment.
    pub data_dir: PathBuf,
    /// Attendance CSV.
    pub ledger_path: PathBuf,
    /// Sample every n-th processed frame.
    pub sample_interval: u64,
    /// Samples collected per enrollment.
    pub max_samples: usize,
    /// Side of the square face crops, in pixels.
    pub crop_size: u32,
    pub scale_factor: f32,
    pub min_neighbors: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            cascade_path: PathBuf::from("haarcascade_frontalface_default.xml"),
            data_dir: PathBuf::from("data"),
            ledger_path: PathBuf::from("attendance.csv"),
            sample_interval: capture::DEFAULT_SAMPLE_INTERVAL,
            max_samples: capture::DEFAULT_MAX_SAMPLES,
            crop_size: capture::DEFAULT_CROP_SIZE,
            scale_factor: detector::DEFAULT_SCALE_FACTOR,
            min_neighbors: detector::DEFAULT_MIN_NEIGHBORS,
        }
    }
}

impl Config {
    /// Load from `$FACELOG_CONFIG` (or `./facelog.toml`) and the environment.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os("FACELOG_CONFIG").map(PathBuf::from);
        let file = match explicit {
            Some(path) => Some(path),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&src)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    /// Override fields from environment variables looked up through `var`.
    ///
    /// Values that fail to parse leave the current setting alone.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACELOG_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("FACELOG_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACELOG_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACELOG_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(v);
        }
        self.sample_interval = env_parse(&var, "FACELOG_SAMPLE_INTERVAL", self.sample_interval);
        self.max_samples = env_parse(&var, "FACELOG_MAX_SAMPLES", self.max_samples);
        self.crop_size = env_parse(&var, "FACELOG_CROP_SIZE", self.crop_size);
        self.scale_factor = env_parse(&var, "FACELOG_SCALE_FACTOR", self.scale_factor);
        self.min_neighbors = env_parse(&var, "FACELOG_MIN_NEIGHBORS", self.min_neighbors);
    }

    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            sample_interval: self.sample_interval,
            max_samples: self.max_samples,
            crop_size: self.crop_size,
        }
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: None,
        }
    }
}

fn env_parse<T: FromStr>(var: impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
                current
            }
        },
        None => current,
    }
}
