//! Concrete [`ConfigSource`](super::ConfigSource) implementations.
//!
//! The polled [`file_source`], plus [`parse_config_str`] for
//! deserializing an in-memory document in any enabled format (YAML,
//! JSON, TOML, each behind its feature flag).

pub mod file_source;

use sha2::{Digest, Sha256};

use crate::config::model::Config;
use crate::error::WatchtowerError;

/// Parse a config string based on file extension.
pub fn parse_config_str(
    ext: &str,
    content: &str,
    path_display: &str,
) -> Result<Config, WatchtowerError> {
    match ext {
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => serde_yml::from_str(content).map_err(|e| WatchtowerError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "json")]
        "json" => serde_json::from_str(content).map_err(|e| WatchtowerError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "toml")]
        "toml" => toml::from_str(content).map_err(|e| WatchtowerError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        other => Err(WatchtowerError::UnsupportedFormat(other.to_string())),
    }
}

/// Lowercase hex SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
