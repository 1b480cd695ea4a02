//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Longest accepted readiness wait (one day)
pub const MAX_READINESS_TIMEOUT_SECS: u64 = 86_400;

/// Longest accepted encoder stop timeout
pub const MAX_STOP_TIMEOUT_SECS: u64 = 600;

/// Longest accepted cleanup grace period
pub const MAX_GRACE_MS: u64 = 60_000;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP listener and public addressing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address the HTTP server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL clients use to reach `/hls`; session URLs are built under it
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_bind() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8787/hls".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Where encoder output lands on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Root directory; each session writes to `<root>/<session id>`
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
    /// File name of the playlist whose appearance marks a session ready
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("hls_streams")
}

fn default_manifest_name() -> String {
    "index.m3u8".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            manifest_name: default_manifest_name(),
        }
    }
}

/// Encoder invocation policy, applied identically to every session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder binary, resolved through PATH when not absolute
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Frames between forced keyframes
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    /// Target HLS segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    /// Number of segments kept in the rolling playlist
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,
    /// Seconds a graceful stop may take before the process is killed
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_video_bitrate() -> String {
    "500k".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_keyframe_interval() -> u32 {
    30
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    5
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            keyframe_interval: default_keyframe_interval(),
            segment_seconds: default_segment_seconds(),
            playlist_size: default_playlist_size(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Manifest polling policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall wait before a session creation is abandoned
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    500
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Teardown policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfig {
    /// Delay between process exit and removal of its output directory
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    1000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

/// Named source locators of one group, keyed by member name
pub type SourceGroup = BTreeMap<String, String>;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Group id -> member name -> source locator
    #[serde(default)]
    pub groups: BTreeMap<String, SourceGroup>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - PORT -> port of server.bind (host kept)
    /// - RELAY_BIND -> server.bind (wins over PORT)
    /// - RELAY_PUBLIC_BASE_URL -> server.public_base_url
    /// - RELAY_OUTPUT_ROOT -> output.root
    /// - RELAY_ENCODER_PROGRAM -> encoder.program
    /// - RELAY_READINESS_TIMEOUT_SECS -> readiness.timeout_secs
    /// - RELAY_CLEANUP_GRACE_MS -> cleanup.grace_ms
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse::<u16>() {
                let host = self
                    .server
                    .bind
                    .rsplit_once(':')
                    .map(|(host, _)| host.to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_string());
                self.server.bind = format!("{}:{}", host, port);
            }
        }

        if let Ok(val) = env::var("RELAY_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_PUBLIC_BASE_URL") {
            if !val.trim().is_empty() {
                self.server.public_base_url = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_OUTPUT_ROOT") {
            if !val.trim().is_empty() {
                self.output.root = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("RELAY_ENCODER_PROGRAM") {
            if !val.trim().is_empty() {
                self.encoder.program = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_READINESS_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.readiness.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("RELAY_CLEANUP_GRACE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.cleanup.grace_ms = ms;
            }
        }
    }

    /// Reject values that parse but cannot drive a session
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "readiness.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.readiness.timeout_secs == 0
            || self.readiness.timeout_secs > MAX_READINESS_TIMEOUT_SECS
        {
            return Err(ConfigError::Invalid(format!(
                "readiness.timeout_secs must be between 1 and {}",
                MAX_READINESS_TIMEOUT_SECS
            )));
        }
        if self.readiness.poll_interval_ms > self.readiness.timeout_secs * 1000 {
            return Err(ConfigError::Invalid(
                "readiness.poll_interval_ms must not exceed the readiness timeout".to_string(),
            ));
        }
        if self.encoder.stop_timeout_secs > MAX_STOP_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "encoder.stop_timeout_secs must be at most {}",
                MAX_STOP_TIMEOUT_SECS
            )));
        }
        if self.cleanup.grace_ms > MAX_GRACE_MS {
            return Err(ConfigError::Invalid(format!(
                "cleanup.grace_ms must be at most {}",
                MAX_GRACE_MS
            )));
        }
        if self.encoder.program.trim().is_empty() {
            return Err(ConfigError::Invalid("encoder.program is empty".to_string()));
        }
        if self.encoder.segment_seconds == 0 || self.encoder.playlist_size == 0 {
            return Err(ConfigError::Invalid(
                "encoder.segment_seconds and encoder.playlist_size must be greater than 0"
                    .to_string(),
            ));
        }
        let mut components = Path::new(&self.output.manifest_name).components();
        let bare_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !bare_name || self.output.manifest_name.contains(std::path::is_separator) {
            return Err(ConfigError::Invalid(format!(
                "output.manifest_name must be a bare file name, got '{}'",
                self.output.manifest_name
            )));
        }
        if self.server.public_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server.public_base_url is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
