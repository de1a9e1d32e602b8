use anyhow::{bail, Context, Result};
use facepass_capture::{SessionConfig, StreamConstraints};
use facepass_core::MatchPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub camera_device: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub db_path: Option<PathBuf>,
    pub match_threshold: Option<f32>,
    pub detection_interval_ms: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub model_load_timeout_secs: Option<u64>,
    pub mirror_preview: Option<bool>,
    pub release_stream_on_capture: Option<bool>,
}

/// CLI configuration: config file, then `FACEPASS_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Path to the SQLite roster database.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance accepted as a match.
    pub match_threshold: f32,
    pub detection_interval_ms: u64,
    pub acquire_timeout_secs: u64,
    pub model_load_timeout_secs: u64,
    pub mirror_preview: bool,
    pub release_stream_on_capture: bool,
    /// The file the settings came from, if one existed.
    pub source: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path(|key| std::env::var(key).ok());
        let file = read_file(&path)?;
        let source = file.is_some().then(|| path.clone());

        let mut config = Self::from_file(file.unwrap_or_default());
        config.source = source;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would silently disable matching.
    pub fn validate(&self) -> Result<()> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            bail!(
                "match_threshold must be a finite, non-negative distance (got {})",
                self.match_threshold
            );
        }
        Ok(())
    }

    pub fn from_file(raw: ConfigFile) -> Self {
        Self {
            camera_device: raw
                .camera_device
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: raw.frame_width.unwrap_or(640),
            frame_height: raw.frame_height.unwrap_or(480),
            db_path: raw
                .db_path
                .unwrap_or_else(|| default_db_path(|key| std::env::var(key).ok())),
            match_threshold: raw
                .match_threshold
                .unwrap_or(facepass_core::matcher::DEFAULT_MATCH_THRESHOLD),
            detection_interval_ms: raw.detection_interval_ms.unwrap_or(200),
            acquire_timeout_secs: raw.acquire_timeout_secs.unwrap_or(10),
            model_load_timeout_secs: raw.model_load_timeout_secs.unwrap_or(30),
            mirror_preview: raw.mirror_preview.unwrap_or(true),
            release_stream_on_capture: raw.release_stream_on_capture.unwrap_or(false),
            source: None,
        }
    }

    /// Apply `FACEPASS_*` overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device) = lookup("FACEPASS_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Some(path) = lookup("FACEPASS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        override_with(&mut self.frame_width, &lookup, "FACEPASS_FRAME_WIDTH");
        override_with(&mut self.frame_height, &lookup, "FACEPASS_FRAME_HEIGHT");
        override_with(&mut self.match_threshold, &lookup, "FACEPASS_MATCH_THRESHOLD");
        override_with(&mut self.detection_interval_ms, &lookup, "FACEPASS_DETECTION_INTERVAL_MS");
        override_with(&mut self.acquire_timeout_secs, &lookup, "FACEPASS_ACQUIRE_TIMEOUT_SECS");
        override_with(
            &mut self.model_load_timeout_secs,
            &lookup,
            "FACEPASS_MODEL_LOAD_TIMEOUT_SECS",
        );
        if let Some(v) = lookup("FACEPASS_MIRROR_PREVIEW").and_then(|v| parse_bool(&v)) {
            self.mirror_preview = v;
        }
        if let Some(v) = lookup("FACEPASS_RELEASE_STREAM_ON_CAPTURE").and_then(|v| parse_bool(&v)) {
            self.release_stream_on_capture = v;
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            constraints: StreamConstraints {
                width: self.frame_width,
                height: self.frame_height,
            },
            detection_interval: Duration::from_millis(self.detection_interval_ms.max(1)),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs.max(1)),
            mirror_preview: self.mirror_preview,
            release_stream_on_capture: self.release_stream_on_capture,
            ..SessionConfig::default()
        }
    }

    pub fn model_load_timeout(&self) -> Duration {
        Duration::from_secs(self.model_load_timeout_secs.max(1))
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
        }
    }
}

fn read_file(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let file = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    tracing::debug!(path = %path.display(), "config file loaded");
    Ok(Some(file))
}

fn config_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(path) = lookup("FACEPASS_CONFIG") {
        return PathBuf::from(path);
    }
    xdg_dir(&lookup, "XDG_CONFIG_HOME", ".config")
        .join("facepass")
        .join("config.toml")
}

fn default_db_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    xdg_dir(&lookup, "XDG_DATA_HOME", ".local/share")
        .join("facepass")
        .join("roster.db")
}

fn xdg_dir(lookup: &impl Fn(&str) -> Option<String>, var: &str, fallback: &str) -> PathBuf {
    lookup(var).map(PathBuf::from).unwrap_or_else(|| {
        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

fn override_with<T: FromStr>(slot: &mut T, lookup: &impl Fn(&str) -> Option<String>, key: &str) {
    match lookup(key).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => *slot = value,
        Some(Err(_)) => tracing::warn!(key, "ignoring unparseable environment override"),
        None => {}
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
