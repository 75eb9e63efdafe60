//! Module identifiers and profile-driven module selection.
//!
//! A [`ModuleId`] names one of the observability backends the gateway
//! fronts. A [`Profile`] is a named selection of modules; the set of
//! enabled modules is computed once at startup by [`enabled_modules`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::model::Config;
use crate::error::WatchtowerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleId {
    Tracing,
    Metrics,
    Logging,
}

impl ModuleId {
    pub const ALL: [Self; 3] = [Self::Tracing, Self::Metrics, Self::Logging];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tracing => "tracing",
            Self::Metrics => "metrics",
            Self::Logging => "logging",
        }
    }

    /// Readiness path probed when the config does not name one.
    #[must_use]
    pub const fn default_health_path(self) -> &'static str {
        match self {
            Self::Tracing => "/",
            Self::Metrics => "/-/healthy",
            Self::Logging => "/ready",
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown module '{0}' (expected tracing, metrics or logging)")]
pub struct UnknownModule(pub String);

impl FromStr for ModuleId {
    type Err = UnknownModule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownModule(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Module(ModuleId),
    All,
}

impl FromStr for Profile {
    type Err = UnknownModule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Module)
        }
    }
}

/// Compute the enabled module set.
///
/// Explicit profiles win, then the config's `enabled` list, then every
/// module that has a backend section. Naming a module without backend
/// configuration is an error.
pub fn enabled_modules(
    profiles: &[Profile],
    config: &Config,
) -> Result<BTreeSet<ModuleId>, WatchtowerError> {
    let configured: BTreeSet<ModuleId> = config.modules.configured().map(|(id, _)| id).collect();

    let requested: BTreeSet<ModuleId> = if !profiles.is_empty() {
        if profiles.contains(&Profile::All) {
            configured.clone()
        } else {
            profiles
                .iter()
                .filter_map(|p| match p {
                    Profile::Module(m) => Some(*m),
                    Profile::All => None,
                })
                .collect()
        }
    } else if let Some(ref enabled) = config.enabled {
        enabled.iter().copied().collect()
    } else {
        configured.clone()
    };

    if let Some(missing) = requested.iter().find(|m| !configured.contains(m)) {
        return Err(WatchtowerError::ModuleStartup {
            module: *missing,
            reason: "module is enabled but has no backend configuration".into(),
        });
    }

    Ok(requested)
}
