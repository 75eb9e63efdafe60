//! Ordered, default-deny access policy.
//!
//! A [`PolicySet`] is an immutable snapshot of [`PolicyRule`]s. The
//! first rule naming the target module whose scope pattern matches one
//! of the principal's scopes decides; no match denies. Snapshots are
//! shared as `Arc<PolicySet>` and replaced whole on reload, so an
//! evaluation never sees a mix of two rule sets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::config::model::PolicyRuleConfig;
use crate::module::ModuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopePattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl ScopePattern {
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Self::Prefix(prefix.to_string())
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    #[must_use]
    pub fn matches(&self, scope: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => scope.starts_with(prefix.as_str()),
            Self::Exact(exact) => scope == exact,
        }
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Prefix(p) => write!(f, "{p}*"),
            Self::Exact(e) => f.write_str(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub scope: ScopePattern,
    pub module: ModuleId,
    pub effect: Effect,
}

impl From<&PolicyRuleConfig> for PolicyRule {
    fn from(rule: &PolicyRuleConfig) -> Self {
        Self {
            scope: ScopePattern::parse(&rule.scope),
            module: rule.module,
            effect: rule.effect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow { rule: usize },
    /// `rule` is `None` when no rule matched (default deny).
    Deny { rule: Option<usize> },
}

impl Decision {
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    rules: Vec<PolicyRule>,
}

impl PolicySet {
    #[must_use]
    pub const fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn from_config(rules: &[PolicyRuleConfig]) -> Self {
        Self::new(rules.iter().map(PolicyRule::from).collect())
    }

    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    #[must_use]
    pub fn authorize(&self, principal: &Principal, module: ModuleId) -> Decision {
        let matched = self.rules.iter().enumerate().find(|(_, rule)| {
            rule.module == module && principal.scopes.iter().any(|s| rule.scope.matches(s))
        });

        match matched {
            Some((idx, rule)) if rule.effect == Effect::Allow => Decision::Allow { rule: idx },
            Some((idx, _)) => Decision::Deny { rule: Some(idx) },
            None => Decision::Deny { rule: None },
        }
    }
}
