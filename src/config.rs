//! Configuration file parser for feedvault.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde, though we log a warning when
//! the file contains potential typos.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid pattern in config: {0}")]
    Pattern(#[from] regex::Error),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// One (tag, attribute) filter the archiver walks when rewriting HTML.
///
/// `attr` names the attribute carrying the resource URL. `tag` restricts the
/// filter to one element name (any element when absent). `value_pattern` is a
/// regex the attribute value must match to be archived.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveOption {
    pub attr: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub value_pattern: Option<String>,
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the SQLite database file.
    pub db_file: String,

    /// Directory holding archived resource files.
    pub archive_dir: String,

    /// URL prefix rewritten into archived content; the excluded HTTP layer
    /// serves `archive_dir` under this prefix.
    pub archive_base_url: String,

    /// User-Agent header sent when fetching feeds and resources.
    pub user_agent: Option<String>,

    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,

    /// Total attempts per resource download.
    pub retry_attempts: u32,

    /// Base delay between resource retries in seconds (jitter is added).
    pub retry_delay_secs: u64,

    /// Maximum size of a single archived resource in bytes.
    pub max_resource_size: u64,

    /// Tag/attribute filters walked when archiving HTML fragments.
    pub archive_options: Vec<ArchiveOption>,

    /// Resource URLs matching any of these regexes are never fetched.
    pub blacklist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_file: "db.sqlite".to_string(),
            archive_dir: "archives".to_string(),
            archive_base_url: "/archives".to_string(),
            user_agent: None,
            timeout_secs: 10,
            retry_attempts: 5,
            retry_delay_secs: 5,
            max_resource_size: 50 * 1024 * 1024,
            archive_options: vec![
                ArchiveOption {
                    attr: "src".to_string(),
                    tag: None,
                    value_pattern: None,
                },
                ArchiveOption {
                    attr: "href".to_string(),
                    tag: None,
                    value_pattern: Some(r"\.(zip|jpg|jpeg|png|webp|mp3)$".to_string()),
                },
            ],
            blacklist: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
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
                // File deleted between metadata and read
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
            let known_keys = [
                "db_file",
                "archive_dir",
                "archive_base_url",
                "user_agent",
                "timeout_secs",
                "retry_attempts",
                "retry_delay_secs",
                "max_resource_size",
                "archive_options",
                "blacklist",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), db_file = %config.db_file, "Loaded configuration");
        Ok(config)
    }

    /// Compile-check every configured regex so a bad pattern is rejected at
    /// startup instead of mid-archive.
    fn validate(&self) -> Result<(), ConfigError> {
        for opt in &self.archive_options {
            if let Some(pattern) = &opt.value_pattern {
                regex::Regex::new(pattern)?;
            }
        }
        for pattern in &self.blacklist {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
