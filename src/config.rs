//! Configuration file parser for ~/.config/loanwatch/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::feed::MAX_FEED_SIZE;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid feed URL '{url}': {reason}")]
    InvalidFeedUrl { url: String, reason: String },

    #[error("No feed URL configured (set feed_url in the config file or pass --url)")]
    MissingFeedUrl,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RSS feed of the library account. Required, but may come from the CLI.
    pub feed_url: Option<String>,

    /// Database file. `None` = `loanwatch.db` in the config directory.
    pub database: Option<PathBuf>,

    /// Minimum minutes between two feed retrievals.
    pub refresh_interval_minutes: u64,

    /// Days ahead of today that still count as "soon".
    pub soon_days: u32,

    /// Timeout for one whole retrieval, connect to last body byte.
    pub fetch_timeout_secs: u64,

    /// Maximum accepted feed size in bytes.
    pub max_feed_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: None,
            database: None,
            refresh_interval_minutes: 10,
            soon_days: 5,
            fetch_timeout_secs: 30,
            max_feed_bytes: MAX_FEED_SIZE,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "feed_url",
        "database",
        "refresh_interval_minutes",
        "soon_days",
        "fetch_timeout_secs",
        "max_feed_bytes",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - `feed_url` that is not http(s) → `Err(ConfigError::InvalidFeedUrl)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        // from a maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        if let Some(url) = &config.feed_url {
            validate_feed_url(url)?;
        }

        tracing::info!(
            path = %path.display(),
            interval_mins = config.refresh_interval_minutes,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// The feed URL, validated.
    pub fn require_feed_url(&self) -> Result<Url, ConfigError> {
        let url = self.feed_url.as_deref().ok_or(ConfigError::MissingFeedUrl)?;
        validate_feed_url(url)
    }

    /// Database location, falling back to `loanwatch.db` in `config_dir`.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| config_dir.join("loanwatch.db"))
    }

    pub fn refresh_interval(&self) -> chrono::Duration {
        let minutes = i64::try_from(self.refresh_interval_minutes).unwrap_or(i64::MAX);
        chrono::Duration::try_minutes(minutes).unwrap_or(chrono::Duration::MAX)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Check that `url` is an absolute http or https URL.
pub fn validate_feed_url(url: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidFeedUrl {
        url: url.to_string(),
        reason,
    };

    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(invalid(format!(
                "unsupported scheme {} (only http/https allowed)",
                scheme
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(parsed)
}

// ============================================================================
// Tests
// ============================================================================
