//! Runtime parameters for the shared-memory log.
//!
//! Loaded from the `[log]` table of the daemon configuration. All sizes
//! are bytes. The parameter set is immutable once the subsystem is
//! bootstrapped; the tag mask is the one runtime-mutable piece and is
//! materialized separately (see [`crate::mask::TagMask`]).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{MAX_LOG_RECLEN, MIN_LOG_RECLEN, MIN_LOG_SPACE, WORD_SIZE};
use crate::mask::TagMask;

/// Error type for parameter loading and validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

fn default_log_space() -> usize {
    80 * 1024 * 1024
}
fn default_log_reclen() -> usize {
    255
}
fn default_log_buffer() -> usize {
    4096
}
fn default_send_timeout() -> f64 {
    600.0
}

/// Shared-memory log parameters — the `[log]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogParams {
    /// Total log ring size in bytes, head included (4 KiB..).
    #[serde(default = "default_log_space")]
    pub log_space: usize,
    /// Per-record payload cap in bytes (16..=4084).
    #[serde(default = "default_log_reclen")]
    pub log_reclen: usize,
    /// Per-writer buffer size in bytes; one buffer flush becomes one
    /// batch record in the ring.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
    /// Tag names suppressed from the start; further changes go through
    /// the live mask.
    #[serde(default)]
    pub masked_tags: Vec<String>,
    /// Total deadline for a gather-writer flush in seconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout: f64,
    /// Flush the per-writer buffer after every append. Slow; meant for
    /// tests that need records in the ring in emission order.
    #[serde(default)]
    pub sync_log: bool,
}

impl Default for LogParams {
    fn default() -> Self {
        Self {
            log_space: default_log_space(),
            log_reclen: default_log_reclen(),
            log_buffer: default_log_buffer(),
            masked_tags: Vec::new(),
            send_timeout: default_send_timeout(),
            sync_log: false,
        }
    }
}

impl LogParams {
    /// Load from a TOML file holding a bare `LogParams` table.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        let params: LogParams =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        params.validate()?;
        tracing::debug!(path = %path.display(), "log parameters loaded");
        Ok(params)
    }

    /// Validate all fields against allowed bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_space < MIN_LOG_SPACE {
            return Err(ConfigError::ValidationError(format!(
                "log.log_space={} below minimum {}",
                self.log_space, MIN_LOG_SPACE
            )));
        }
        if self.log_space % WORD_SIZE != 0 {
            return Err(ConfigError::ValidationError(format!(
                "log.log_space={} not a multiple of {}",
                self.log_space, WORD_SIZE
            )));
        }
        if !(MIN_LOG_RECLEN..=MAX_LOG_RECLEN).contains(&self.log_reclen) {
            return Err(ConfigError::ValidationError(format!(
                "log.log_reclen={} out of range [{}, {}]",
                self.log_reclen, MIN_LOG_RECLEN, MAX_LOG_RECLEN
            )));
        }
        if self.log_buffer < 2 * (self.log_reclen + 8) {
            return Err(ConfigError::ValidationError(format!(
                "log.log_buffer={} too small for log_reclen={} (minimum {})",
                self.log_buffer,
                self.log_reclen,
                2 * (self.log_reclen + 8)
            )));
        }
        if self.send_timeout <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "log.send_timeout={} must be > 0",
                self.send_timeout
            )));
        }
        for name in &self.masked_tags {
            if crate::tags::Tag::from_name(name).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "log.masked_tags contains unknown tag '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Build the live suppression map from `masked_tags`.
    ///
    /// `validate()` has already rejected unknown names, so this cannot
    /// fail after a successful load.
    pub fn initial_mask(&self) -> TagMask {
        TagMask::from_names(self.masked_tags.iter().map(String::as_str))
            .expect("masked_tags validated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        assert!(LogParams::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"log_space = 4096
log_reclen = 64
log_buffer = 1024
masked_tags = ["Debug"]
"#
        )
        .unwrap();
        file.flush().unwrap();

        let params = LogParams::load(file.path()).unwrap();
        assert_eq!(params.log_space, 4096);
        assert_eq!(params.log_reclen, 64);
        assert!(params.initial_mask().is_masked(crate::tags::Tag::Debug));
        assert!(!params.sync_log);
    }

    #[test]
    fn test_rejects_bad_bounds() {
        let params = LogParams {
            log_space: 100,
            ..LogParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let params = LogParams {
            log_reclen: 8000,
            ..LogParams::default()
        };
        assert!(params.validate().is_err());

        let params = LogParams {
            log_buffer: 64,
            log_reclen: 255,
            ..LogParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_masked_tag() {
        let params = LogParams {
            masked_tags: vec!["Bogus".to_string()],
            ..LogParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_field() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "log_spaec = 4096\n").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            LogParams::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
