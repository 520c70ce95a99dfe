//! Typed configuration shared by the edge agent and the inference worker,
//! §6.6 of the spec.
//!
//! Both binaries load a single TOML file into a [`PipelineConfig`]. Unknown
//! keys are rejected (`deny_unknown_fields`) so a typo in a config file
//! fails fast at startup rather than silently using a default. Any
//! path-valued field is resolved relative to the config file's own
//! directory, following `braid-config-data`'s handling of relative paths.

mod error;

use std::path::{Path, PathBuf};

pub use error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Capture source: the shared-memory socket the capture child writes into.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps_hub")]
    pub fps_hub: u32,
    pub socket_path: PathBuf,
    #[serde(default = "default_shm_size_mb")]
    pub shm_size_mb: u32,
}

fn default_fps_hub() -> u32 {
    15
}

fn default_shm_size_mb() -> u32 {
    64
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            width: 1920,
            height: 1080,
            fps_hub: default_fps_hub(),
            socket_path: PathBuf::from("capture.sock"),
            shm_size_mb: default_shm_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FpsConfig {
    pub idle: u32,
    pub active: u32,
}

impl Default for FpsConfig {
    fn default() -> Self {
        Self { idle: 1, active: 8 }
    }
}

/// Connection target and model parameters for the inference worker.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferenceConfig {
    pub worker_host: String,
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    pub model_name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u32,
    #[serde(default)]
    pub classes_filter: Option<Vec<String>>,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
    #[serde(default)]
    pub fps: FpsConfig,
}

fn default_worker_port() -> u16 {
    9700
}

fn default_max_inflight() -> u32 {
    4
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            worker_host: "127.0.0.1".into(),
            worker_port: default_worker_port(),
            model_name: String::new(),
            width: 1920,
            height: 1080,
            max_inflight: default_max_inflight(),
            classes_filter: None,
            confidence_threshold: None,
            fps: FpsConfig::default(),
        }
    }
}

/// Orchestrator hysteresis timers, §4.7.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsmConfig {
    /// Milliseconds a relevant detection must hold before a session opens.
    pub dwell_ms: u64,
    /// Milliseconds without a relevant detection before a session starts closing.
    pub silence_ms: u64,
    /// Milliseconds after silence before a session actually closes.
    pub postroll_ms: u64,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 500,
            silence_ms: 3_000,
            postroll_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub base_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8554,
            path: "/live".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_frame_cache_ttl_ms")]
    pub frame_cache_ttl_ms: u64,
}

fn default_frame_cache_ttl_ms() -> u64 {
    2_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            frame_cache_ttl_ms: default_frame_cache_ttl_ms(),
        }
    }
}

/// Worker-side persistence knobs. Not named in the distilled option set but
/// required for the session writer (§4.11) to have anywhere to write.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub listen_host: String,
    #[serde(default = "default_worker_port")]
    pub listen_port: u16,
    pub out_dir: PathBuf,
    #[serde(default = "default_segment_duration_s")]
    pub segment_duration_s: f64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u64,
}

fn default_segment_duration_s() -> f64 {
    60.0
}

fn default_max_frame_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: default_worker_port(),
            out_dir: PathBuf::from("sessions"),
            segment_duration_s: default_segment_duration_s(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_device_id() -> String {
    "edge-agent".to_string()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Identifies this edge device to the session store; not named in the
    /// distilled option set (§6.6) but required by the `deviceId` field of
    /// `POST /sessions` (§6.3).
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub fsm: FsmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            source: SourceConfig::default(),
            inference: InferenceConfig::default(),
            fsm: FsmConfig::default(),
            store: StoreConfig::default(),
            publisher: PublisherConfig::default(),
            cache: CacheConfig::default(),
            worker: WorkerConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if let Some(thresh) = self.inference.confidence_threshold {
            if !(0.0..=1.0).contains(&thresh) {
                return Err(Error::InvalidConfidenceThreshold(thresh));
            }
        }
        if self.worker.segment_duration_s <= 0.0 {
            return Err(Error::InvalidSegmentDuration);
        }
        Ok(())
    }

    /// Rewrites any relative filesystem paths to be relative to `base_dir`
    /// (the directory the config file was loaded from), mirroring
    /// `braid-config-data`'s treatment of relative paths in config files.
    fn fixup_relative_paths(&mut self, base_dir: &Path) {
        if self.source.socket_path.is_relative() {
            self.source.socket_path = base_dir.join(&self.source.socket_path);
        }
        if self.worker.out_dir.is_relative() {
            self.worker.out_dir = base_dir.join(&self.worker.out_dir);
        }
    }
}

/// Reads, shell-expands, and parses a TOML config file, fixing up relative
/// paths against the file's own directory and rejecting out-of-range values.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<PipelineConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let expanded = shellexpand::full(&raw)?;
    let mut config: PipelineConfig = toml::from_str(&expanded)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    config.fixup_relative_paths(base_dir);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = PipelineConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let text = "bogus_top_level_key = 1\n";
        assert!(toml::from_str::<PipelineConfig>(text).is_err());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pipeline.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [source]
            uri = "test"
            width = 640
            height = 480
            socket_path = "capture.sock"

            [inference]
            worker_host = "127.0.0.1"
            model_name = "yolo"
            width = 640
            height = 480

            [store]
            base_url = "http://store"

            [publisher]
            host = "127.0.0.1"
            port = 8554
            path = "/live"

            [worker]
            listen_host = "0.0.0.0"
            out_dir = "sessions"
            "#
        )
        .unwrap();

        let config = parse_config_file(&config_path).unwrap();
        assert_eq!(config.source.socket_path, dir.path().join("capture.sock"));
        assert_eq!(config.worker.out_dir, dir.path().join("sessions"));
    }

    #[test]
    fn rejects_out_of_range_confidence_threshold() {
        let mut config = PipelineConfig::default();
        config.inference.confidence_threshold = Some(1.5);
        assert!(config.validate().is_err());
    }
}
