//! Configuration loading, validation, and hot-reloading.
//!
//! Defines the [`ConfigSource`] trait for config backends and
//! [`ConfigVersion`] for change detection. [`resolve_source`] picks a
//! file source from an explicit path or by probing the working
//! directory. Submodules provide the data model, validation logic, and
//! the file-format sources.

pub mod model;
pub mod sources;
pub mod validation;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::WatchtowerError;
use model::{Config, KeyAlgorithm, SigningKey};
use sources::file_source::{FileFormat, FileSource};

/// Env var holding an extra HS256 secret registered under key id `env`.
pub const AUTH_SECRET_ENV: &str = "WATCHTOWER_AUTH_SECRET";

const CANDIDATES: &[&str] = &[
    "watchtower.yaml",
    "watchtower.yml",
    "watchtower.json",
    "watchtower.toml",
];

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigVersion {
    Hash(String),
}

impl ConfigVersion {
    /// First eight hex digits, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        match self {
            Self::Hash(h) => h.get(..8).unwrap_or(h),
        }
    }
}

// Used as Box<dyn ConfigSource>, which native async trait methods can't do.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self) -> Result<(Config, ConfigVersion), WatchtowerError>;
    async fn has_changed(&self, current: &ConfigVersion) -> Result<bool, WatchtowerError>;
}

/// Use `explicit` when given, else the first `watchtower.*` file found in
/// the working directory.
pub async fn resolve_source(
    explicit: Option<&Path>,
) -> Result<Box<dyn ConfigSource>, WatchtowerError> {
    if let Some(path) = explicit {
        return open_file_source(path);
    }

    for name in CANDIDATES {
        let path = PathBuf::from(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!(path = %path.display(), "auto-detected config file");
            return open_file_source(&path);
        }
    }

    Err(WatchtowerError::NoConfigSource {
        hint: "Provide --config <file> or place watchtower.yaml in the working directory."
            .into(),
    })
}

pub fn open_file_source(path: &Path) -> Result<Box<dyn ConfigSource>, WatchtowerError> {
    match FileFormat::from_path(path) {
        Some(format) => Ok(Box::new(FileSource::new(path.to_path_buf(), format))),
        None => Err(WatchtowerError::UnsupportedFormat(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string(),
        )),
    }
}

/// Register `secret` as an HS256 key with id `env`, replacing any
/// configured key of that id.
pub fn apply_env_secret(config: &mut Config, secret: Option<String>) {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return;
    };
    config.auth.keys.retain(|k| k.id != "env");
    config.auth.keys.push(SigningKey {
        id: "env".into(),
        secret,
        algorithm: KeyAlgorithm::HS256,
    });
}
