//! File-based config source with SHA-256 change detection.
//!
//! [`FileSource`] reads the file with Tokio, parses it according to its
//! [`FileFormat`], validates the result, and versions it by content hash.
//! A reload that fails to parse or validate surfaces as an error so the
//! caller can keep serving the previous snapshot.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{parse_config_str, sha256_hex};
use crate::config::model::Config;
use crate::config::validation::validate;
use crate::config::{ConfigSource, ConfigVersion};
use crate::error::WatchtowerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
    Toml,
}

impl FileFormat {
    /// Format for a path's extension, if compiled in.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str())? {
            #[cfg(feature = "yaml")]
            "yaml" | "yml" => Some(Self::Yaml),
            #[cfg(feature = "json")]
            "json" => Some(Self::Json),
            #[cfg(feature = "toml")]
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Toml => "toml",
        }
    }
}

#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    format: FileFormat,
}

impl FileSource {
    #[must_use]
    pub const fn new(path: PathBuf, format: FileFormat) -> Self {
        Self { path, format }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_content(&self) -> Result<String, WatchtowerError> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WatchtowerError::ConfigFileNotFound {
                    path: self.path.clone(),
                }
            } else {
                WatchtowerError::Io(e)
            }
        })
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> &'static str {
        self.format.name()
    }

    async fn load(&self) -> Result<(Config, ConfigVersion), WatchtowerError> {
        let content = self.read_content().await?;
        let config = parse_config_str(
            self.format.name(),
            &content,
            &self.path.display().to_string(),
        )?;

        validate(&config).map_err(|errors| WatchtowerError::ConfigValidation { errors })?;

        Ok((config, ConfigVersion::Hash(sha256_hex(content.as_bytes()))))
    }

    async fn has_changed(&self, current: &ConfigVersion) -> Result<bool, WatchtowerError> {
        let content = self.read_content().await?;
        Ok(*current != ConfigVersion::Hash(sha256_hex(content.as_bytes())))
    }
}
