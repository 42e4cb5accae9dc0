//! Configuration for recording, decoding and remote control
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. A file only needs the keys it overrides:
//!
//! ```toml
//! [recorder]
//! output = "/tmp/app_trace.txt"
//! hotspot_threshold_ms = 250
//!
//! [decoder]
//! coalesce_gap_ms = 1000
//!
//! [remote]
//! port = 9200
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Module name patterns dropped from decoded calls and spans
///
/// Covers the tracer itself, host bootstrap and pseudo modules, and the
/// module-loading machinery.
pub const DEFAULT_DENYLIST: &[&str] = &[
    r"^modscope(\.|$)",
    r"^host\.",
    r"^<",
    r"^(runpy|pkgutil)$",
    r"(^|\.)importlib(\.|$)",
];

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Recorder core and metrics sampler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Trace log path; defaults to `$HOME/modscope_trace_<program>.txt`
    pub output: Option<PathBuf>,
    /// Minimum time between opportunistic flushes from the call hook
    pub flush_interval_ms: u64,
    /// Calls slower than this emit a `Return` span
    pub hotspot_threshold_ms: u64,
    /// Metrics sampler cadence
    pub metrics_interval_ms: u64,
    /// Take a heap census every N sampler cycles
    pub heap_every: u32,
    /// Number of types kept per heap snapshot (plus one total entry)
    pub heap_top: usize,
    /// Run the background metrics sampler while tracing
    pub sample_metrics: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output: None,
            flush_interval_ms: 1000,
            hotspot_threshold_ms: 100,
            metrics_interval_ms: 500,
            heap_every: 20,
            heap_top: 20,
            sample_metrics: true,
        }
    }
}

impl RecorderConfig {
    /// Resolved trace log path
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(default_output_path)
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }
}

/// Decoder / aggregator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Calls to one callsite closer together than this are merged into one record
    pub coalesce_gap_ms: u64,
    /// Regex patterns of module names whose calls are dropped
    pub denylist: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            coalesce_gap_ms: 500,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Remote control endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9135,
        }
    }
}

impl RemoteConfig {
    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL a controller uses to reach the endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recorder: RecorderConfig,
    pub decoder: DecoderConfig,
    pub remote: RemoteConfig,
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings the recorder or decoder cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let recorder = &self.recorder;
        if recorder.metrics_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "recorder.metrics_interval_ms must be > 0".to_string(),
            ));
        }
        if recorder.heap_every == 0 {
            return Err(ConfigError::Invalid(
                "recorder.heap_every must be > 0".to_string(),
            ));
        }
        if recorder.heap_top == 0 {
            return Err(ConfigError::Invalid(
                "recorder.heap_top must be > 0".to_string(),
            ));
        }
        for pattern in &self.decoder.denylist {
            Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("decoder.denylist pattern {:?}: {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// `$HOME/modscope_trace_<program>.txt`, falling back to the working directory
pub fn default_output_path() -> PathBuf {
    let dir = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join(format!("modscope_trace_{}.txt", program_name()))
}

/// Stem of the running executable
fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_stem)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.recorder.flush_interval_ms, 1000);
        assert_eq!(config.recorder.hotspot_threshold_ms, 100);
        assert_eq!(config.recorder.metrics_interval_ms, 500);
        assert_eq!(config.recorder.heap_every, 20);
        assert_eq!(config.recorder.heap_top, 20);
        assert_eq!(config.decoder.coalesce_gap_ms, 500);
        assert_eq!(config.remote.port, 9135);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml_str(
            r#"
            [recorder]
            hotspot_threshold_ms = 250
            output = "/tmp/trace.txt"

            [remote]
            port = 9200
            "#,
        )
        .unwrap();
        assert_eq!(config.recorder.hotspot_threshold_ms, 250);
        assert_eq!(config.recorder.flush_interval_ms, 1000);
        assert_eq!(
            config.recorder.output_path(),
            PathBuf::from("/tmp/trace.txt")
        );
        assert_eq!(config.remote.bind_addr(), "127.0.0.1:9200");
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let err = Config::from_toml_str("[recorder]\nmetrics_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("metrics_interval_ms"));
    }

    #[test]
    fn test_bad_denylist_pattern_rejected() {
        let err = Config::from_toml_str("[decoder]\ndenylist = [\"(\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unparseable_document() {
        let err = Config::from_toml_str("[recorder\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_default_output_path_names_program() {
        let path = default_output_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("modscope_trace_"));
        assert!(name.ends_with(".txt"));
    }
}
