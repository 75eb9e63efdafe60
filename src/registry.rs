//! Startup-time table of backend adapters.
//!
//! Modules are registered once through [`ModuleRegistryBuilder`] while
//! the process boots; [`ModuleRegistryBuilder::build`] freezes the table
//! into a [`ModuleRegistry`] that is only ever read afterwards.
//! [`bootstrap`] is the startup path: construct and health-check each
//! enabled module, failing hard for required ones.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::backend::BackendAdapter;
use crate::config::model::{Config, ModuleConfig};
use crate::error::WatchtowerError;
use crate::module::ModuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("module '{0}' is not registered")]
pub struct NotFound(pub ModuleId);

#[derive(Default)]
pub struct ModuleRegistryBuilder {
    adapters: BTreeMap<ModuleId, Arc<dyn BackendAdapter>>,
}

impl ModuleRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the adapter for `id`, replacing any earlier registration.
    pub fn register(&mut self, id: ModuleId, adapter: Arc<dyn BackendAdapter>) -> &mut Self {
        if self.adapters.insert(id, adapter).is_some() {
            tracing::warn!(module = %id, "module registered twice, keeping the last adapter");
        }
        self
    }

    #[must_use]
    pub fn build(self) -> ModuleRegistry {
        ModuleRegistry {
            adapters: self.adapters,
        }
    }
}

pub struct ModuleRegistry {
    adapters: BTreeMap<ModuleId, Arc<dyn BackendAdapter>>,
}

impl ModuleRegistry {
    pub fn lookup(&self, id: ModuleId) -> Result<&Arc<dyn BackendAdapter>, NotFound> {
        self.adapters.get(&id).ok_or(NotFound(id))
    }

    #[must_use]
    pub fn contains(&self, id: ModuleId) -> bool {
        self.adapters.contains_key(&id)
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.adapters.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Arc<dyn BackendAdapter>)> {
        self.adapters.iter().map(|(id, a)| (*id, a))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.adapters.keys()).finish()
    }
}

/// Build the registry for `enabled`.
///
/// `construct` creates the adapter for one module. A required module
/// whose adapter cannot be built or fails its startup health check aborts
/// startup; an optional one is skipped with a warning.
pub async fn bootstrap<F>(
    config: &Config,
    enabled: &BTreeSet<ModuleId>,
    construct: F,
) -> Result<ModuleRegistry, WatchtowerError>
where
    F: Fn(ModuleId, &ModuleConfig) -> Result<Arc<dyn BackendAdapter>, WatchtowerError>,
{
    let mut builder = ModuleRegistryBuilder::new();

    for &id in enabled {
        let Some(module) = config.modules.get(id) else {
            return Err(WatchtowerError::ModuleStartup {
                module: id,
                reason: "module is enabled but has no backend configuration".into(),
            });
        };

        let started = match construct(id, module) {
            Ok(adapter) => adapter
                .health_check()
                .await
                .map(|()| adapter)
                .map_err(|e| WatchtowerError::ModuleStartup {
                    module: id,
                    reason: format!("startup health check failed: {e}"),
                }),
            Err(e) => Err(e),
        };

        match started {
            Ok(adapter) => {
                tracing::info!(module = %id, url = %module.url, "module registered");
                builder.register(id, adapter);
            }
            Err(e) if module.required => return Err(e),
            Err(e) => {
                tracing::warn!(module = %id, error = %e, "optional module unavailable, disabling");
            }
        }
    }

    Ok(builder.build())
}
