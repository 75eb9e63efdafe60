//! Serde data structures for the Watchtower configuration file.
//!
//! Contains [`Config`] (the root), the per-module backend sections
//! ([`Modules`], [`ModuleConfig`], [`PoolConfig`]), routing ([`Routing`],
//! [`RoutingRule`]), credentials ([`AuthConfig`], [`SigningKey`]), the
//! ordered [`PolicyRuleConfig`] list, [`RetryConfig`], and forwarding
//! [`Defaults`] with [`HeaderRules`]. All types derive `Serialize` and
//! `Deserialize` with `deny_unknown_fields` for strict parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::module::ModuleId;
use crate::policy::Effect;

const fn default_timeout() -> u64 {
    5000
}

const fn default_true() -> bool {
    true
}

const fn default_max_connections() -> usize {
    64
}

const fn default_acquire_timeout() -> u64 {
    1000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_backoff() -> u64 {
    50
}

const fn default_max_backoff() -> u64 {
    1000
}

const fn default_leeway() -> u64 {
    30
}

fn default_marker_header() -> String {
    "x-watchtower-module".to_string()
}

fn default_scope_claim() -> String {
    "scope".to_string()
}

fn default_rules() -> Vec<RoutingRule> {
    ModuleId::ALL
        .into_iter()
        .map(|m| RoutingRule {
            module: m,
            host: None,
            path_prefix: Some(format!("/{m}")),
            strip_prefix: true,
        })
        .collect()
}

fn is_default_timeout(v: &u64) -> bool {
    *v == default_timeout()
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub modules: Modules,

    /// Enabled module set used when no profile is given on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Vec<ModuleId>>,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy: Vec<PolicyRuleConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub defaults: Defaults,
}

impl Config {
    #[must_use]
    pub fn total_policy_rules(&self) -> usize {
        self.policy.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Modules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<ModuleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ModuleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<ModuleConfig>,
}

impl Modules {
    #[must_use]
    pub const fn get(&self, id: ModuleId) -> Option<&ModuleConfig> {
        match id {
            ModuleId::Tracing => self.tracing.as_ref(),
            ModuleId::Metrics => self.metrics.as_ref(),
            ModuleId::Logging => self.logging.as_ref(),
        }
    }

    pub fn set(&mut self, id: ModuleId, module: ModuleConfig) {
        let slot = match id {
            ModuleId::Tracing => &mut self.tracing,
            ModuleId::Metrics => &mut self.metrics,
            ModuleId::Logging => &mut self.logging,
        };
        *slot = Some(module);
    }

    pub fn configured(&self) -> impl Iterator<Item = (ModuleId, &ModuleConfig)> {
        ModuleId::ALL
            .into_iter()
            .filter_map(|id| self.get(id).map(|m| (id, m)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    /// Backend base URL, e.g. `http://prometheus:9090`.
    pub url: String,

    /// Abort startup when the backend is unreachable.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub required: bool,

    #[serde(
        default = "default_timeout",
        skip_serializing_if = "is_default_timeout"
    )]
    pub timeout: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl ModuleConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            required: true,
            timeout: default_timeout(),
            health_path: None,
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Milliseconds a request may wait for a free backend slot.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Routing {
    /// Header carrying an explicit module name.
    #[serde(default = "default_marker_header")]
    pub marker_header: String,

    #[serde(default = "default_rules")]
    pub rules: Vec<RoutingRule>,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            marker_header: default_marker_header(),
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingRule {
    pub module: ModuleId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<SigningKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,

    /// Clock skew tolerance in seconds for `exp` / `nbf`.
    #[serde(default = "default_leeway")]
    pub leeway: u64,

    #[serde(default = "default_scope_claim")]
    pub scope_claim: String,

    /// Revoked token ids (`jti`) or subjects (`sub`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revoked: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            issuer: None,
            audience: None,
            leeway: default_leeway(),
            scope_claim: default_scope_claim(),
            revoked: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum KeyAlgorithm {
    #[default]
    HS256,
    HS384,
    HS512,
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SigningKey {
    pub id: String,
    pub secret: String,

    #[serde(default)]
    pub algorithm: KeyAlgorithm,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRuleConfig {
    pub scope: String,
    pub module: ModuleId,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total forward attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub forward_headers: bool,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub proxy_headers: bool,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub strip_hop_by_hop: bool,

    /// Pass the caller's `Authorization` header through to the backend.
    #[serde(default, skip_serializing_if = "is_false")]
    pub forward_credentials: bool,

    #[serde(default, skip_serializing_if = "HeaderRules::is_default")]
    pub headers: HeaderRules,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            forward_headers: default_true(),
            proxy_headers: default_true(),
            strip_hop_by_hop: default_true(),
            forward_credentials: false,
            headers: HeaderRules::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderRules {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub add: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strip: Vec<String>,
}

impl HeaderRules {
    fn is_default(&self) -> bool {
        self.add.is_empty() && self.strip.is_empty()
    }
}
