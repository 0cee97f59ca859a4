//! Configuration types for Reel

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{ReelError, Result};

/// Cassette mode requested when a session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Forward live and append every interaction to the cassette
    Record,
    /// Replay from the cassette, falling back to the network on a miss
    Replay,
    /// Replay only; a miss is an error and never touches the network
    ReplayStrict,
    /// Strict replay where each interaction can be replayed once
    Once,
    /// Replay if the cassette exists, record otherwise
    #[serde(alias = "hybrid")]
    Auto,
    /// Forward everything live without recording or matching
    Passthrough,
}

/// On-disk cassette format written by `save`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// Pretty JSON, one object per cassette (`<name>.json`)
    #[default]
    Json,
    /// Binary container (`<name>.reel`), requires the `binary` feature
    Binary,
}

impl StorageFormat {
    /// File extension for this format
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "reel",
        }
    }

    /// Whether this build can read and write the format
    #[must_use]
    pub fn is_supported(self) -> bool {
        match self {
            Self::Json => true,
            Self::Binary => cfg!(feature = "binary"),
        }
    }
}

/// How a request body breaks ties between method+URL candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyTieBreak {
    /// Earliest candidate whose body is byte-identical, else earliest candidate
    #[default]
    PreferExact,
    /// Earliest candidate regardless of body
    Ignore,
}

/// Delay applied before returning a replayed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LatencyMode {
    /// Respond immediately
    #[default]
    None,
    /// Sleep for the response time measured while recording
    Recorded,
    /// Sleep for a fixed number of milliseconds
    Fixed {
        /// Delay in milliseconds
        ms: u64,
    },
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for storing/loading cassettes
    pub cassette_dir: PathBuf,
    /// Format written on save
    #[serde(default)]
    pub format: StorageFormat,
    /// Replay behaviour
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Recording behaviour
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Redaction configuration
    #[serde(default)]
    pub redaction: RedactionConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Lenient replay forwards misses to the network instead of failing
    #[serde(default = "default_true")]
    pub allow_network_fallback: bool,
    /// Body-aware tie-break policy
    #[serde(default)]
    pub body_tie_break: BodyTieBreak,
    /// Latency simulation
    #[serde(default)]
    pub latency: LatencyMode,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            allow_network_fallback: true,
            body_tie_break: BodyTieBreak::default(),
            latency: LatencyMode::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Recording configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Start from an empty cassette instead of appending to the stored one
    #[serde(default)]
    pub overwrite: bool,
    /// Response statuses that are returned but not recorded
    #[serde(default)]
    pub skip_status_codes: Vec<u16>,
}

/// Redaction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Header names whose values are replaced before recording
    #[serde(default)]
    pub headers: Vec<String>,
    /// Literal secrets to redact from URLs, header values and bodies
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes
    pub max_request_size: usize,
    /// Maximum recorded response body size in bytes
    pub max_response_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
        }
    }
}

/// Per-session overrides applied on top of [`EngineConfig`]
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Override `replay.allow_network_fallback`
    pub allow_network_fallback: Option<bool>,
    /// Override `replay.body_tie_break`
    pub body_tie_break: Option<BodyTieBreak>,
    /// Override `replay.latency`
    pub latency: Option<LatencyMode>,
    /// Override `recording.overwrite`
    pub overwrite: Option<bool>,
}

impl EngineConfig {
    /// Configuration with defaults for everything but the cassette directory
    #[must_use]
    pub fn new(cassette_dir: impl Into<PathBuf>) -> Self {
        Self {
            cassette_dir: cassette_dir.into(),
            format: StorageFormat::default(),
            replay: ReplayConfig::default(),
            recording: RecordingConfig::default(),
            redaction: RedactionConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReelError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ReelError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.cassette_dir.as_os_str().is_empty() {
            return Err(ReelError::ConfigError(
                "cassette_dir cannot be empty".to_string(),
            ));
        }

        if self.cassette_dir.exists() && !self.cassette_dir.is_dir() {
            return Err(ReelError::ConfigError(format!(
                "cassette_dir is not a directory: {}",
                self.cassette_dir.display()
            )));
        }

        if !self.format.is_supported() {
            return Err(ReelError::ConfigError(format!(
                "format '{}' is not supported by this build",
                self.format.extension()
            )));
        }

        if self.limits.max_request_size == 0 {
            return Err(ReelError::ConfigError(
                "max_request_size must be > 0".to_string(),
            ));
        }

        if self.limits.max_response_size == 0 {
            return Err(ReelError::ConfigError(
                "max_response_size must be > 0".to_string(),
            ));
        }

        if self.redaction.secrets.iter().any(String::is_empty) {
            return Err(ReelError::ConfigError(
                "redaction secrets cannot be empty strings".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy of this configuration with session overrides applied
    #[must_use]
    pub fn with_options(&self, options: &SessionOptions) -> Self {
        let mut config = self.clone();
        if let Some(fallback) = options.allow_network_fallback {
            config.replay.allow_network_fallback = fallback;
        }
        if let Some(tie_break) = options.body_tie_break {
            config.replay.body_tie_break = tie_break;
        }
        if let Some(latency) = options.latency {
            config.replay.latency = latency;
        }
        if let Some(overwrite) = options.overwrite {
            config.recording.overwrite = overwrite;
        }
        config
    }
}
