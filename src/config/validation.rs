//! Configuration validation with detailed error reporting.
//!
//! [`validate`] checks a parsed [`Config`] for problems serde cannot see:
//! unreachable backend URLs, zero-sized pools, routing rules that match
//! nothing or collide, unusable signing keys, malformed scope patterns and
//! header names. Every problem is collected so one run reports them all.

use std::collections::{BTreeSet, HashMap, HashSet};

use axum::http::{HeaderName, HeaderValue};
use url::Url;

use super::model::Config;
use crate::error::ValidationError;

/// Upper bound on `retry.max_attempts`, first attempt included.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

fn err(section: &str, field: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError {
        section: section.into(),
        field: field.into(),
        message: message.into(),
        suggestion: None,
    }
}

/// Validate a backend base URL. Returns `Ok(())` or a human-readable error.
pub fn validate_backend_url(url: &str) -> Result<(), String> {
    match Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if scheme != "http" && scheme != "https" {
                Err(format!(
                    "unsupported scheme '{scheme}' (expected http or https)"
                ))
            } else if parsed.host_str().is_none() {
                Err(format!("'{url}' has no host"))
            } else {
                Ok(())
            }
        }
        Err(_) => Err(format!("'{url}' is not a valid URL")),
    }
}

/// Validate a scope pattern: `*`, `prefix*`, or an exact scope.
pub fn validate_scope_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("scope cannot be empty".into());
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(format!("'{pattern}' contains whitespace"));
    }
    let body = pattern.strip_suffix('*').unwrap_or(pattern);
    if body.contains('*') {
        return Err(format!("'{pattern}' may only use '*' as its last character"));
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_modules(config, &mut errors);
    validate_routing(config, &mut errors);
    validate_auth(config, &mut errors);
    validate_policy(config, &mut errors);
    validate_retry(config, &mut errors);
    validate_defaults(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_modules(config: &Config, errors: &mut Vec<ValidationError>) {
    if config.modules.configured().next().is_none() {
        errors.push(ValidationError {
            suggestion: Some("add e.g. 'modules.metrics.url'".into()),
            ..err("modules", "modules", "at least one module must be configured")
        });
    }

    for (id, module) in config.modules.configured() {
        let field = |name: &str| format!("{id}.{name}");

        if let Err(msg) = validate_backend_url(&module.url) {
            errors.push(err("modules", field("url"), msg));
        }
        if module.timeout == 0 {
            errors.push(err("modules", field("timeout"), "timeout must be > 0"));
        }
        if let Some(path) = &module.health_path {
            if !path.starts_with('/') {
                errors.push(ValidationError {
                    suggestion: Some(format!("did you mean '/{path}'?")),
                    ..err("modules", field("health_path"), "path must start with '/'")
                });
            }
        }
        if module.pool.max_connections == 0 {
            errors.push(err(
                "modules",
                field("pool.max_connections"),
                "pool must allow at least one connection",
            ));
        }
    }

    if let Some(enabled) = &config.enabled {
        for id in enabled {
            if config.modules.get(*id).is_none() {
                errors.push(err(
                    "enabled",
                    id.as_str(),
                    format!("module '{id}' is enabled but has no 'modules.{id}' entry"),
                ));
            }
        }
    }
}

fn validate_routing(config: &Config, errors: &mut Vec<ValidationError>) {
    let routing = &config.routing;

    if HeaderName::from_bytes(routing.marker_header.as_bytes()).is_err() {
        errors.push(err(
            "routing",
            "marker_header",
            format!("'{}' is not a valid header name", routing.marker_header),
        ));
    }

    let mut seen: HashMap<(Option<String>, Option<String>), usize> = HashMap::new();
    for (i, rule) in routing.rules.iter().enumerate() {
        let field = |name: &str| format!("rules[{i}].{name}");

        if rule.host.is_none() && rule.path_prefix.is_none() {
            errors.push(err(
                "routing",
                format!("rules[{i}]"),
                "rule must name a host, a path_prefix, or both",
            ));
            continue;
        }
        if let Some(host) = &rule.host {
            if host.is_empty() {
                errors.push(err("routing", field("host"), "host cannot be empty"));
            }
        }
        if let Some(prefix) = &rule.path_prefix {
            if !prefix.starts_with('/') {
                errors.push(ValidationError {
                    suggestion: Some(format!("did you mean '/{prefix}'?")),
                    ..err("routing", field("path_prefix"), "prefix must start with '/'")
                });
            }
        }

        let key = (
            rule.host.as_ref().map(|h| h.to_ascii_lowercase()),
            rule.path_prefix
                .as_ref()
                .map(|p| p.trim_end_matches('/').to_string()),
        );
        if let Some(&first) = seen.get(&key) {
            if routing.rules[first].module != rule.module {
                errors.push(err(
                    "routing",
                    format!("rules[{i}]"),
                    format!(
                        "same host/prefix as rules[{first}] but routes to '{}' instead of '{}'",
                        rule.module, routing.rules[first].module
                    ),
                ));
            }
        } else {
            seen.insert(key, i);
        }
    }
}

fn validate_auth(config: &Config, errors: &mut Vec<ValidationError>) {
    let auth = &config.auth;
    let mut ids = HashSet::new();

    for (i, key) in auth.keys.iter().enumerate() {
        if key.id.is_empty() {
            errors.push(err("auth", format!("keys[{i}].id"), "key id cannot be empty"));
        } else if !ids.insert(key.id.as_str()) {
            errors.push(err(
                "auth",
                format!("keys[{i}].id"),
                format!("duplicate key id '{}'", key.id),
            ));
        }
        if key.secret.is_empty() {
            errors.push(err(
                "auth",
                format!("keys[{i}].secret"),
                "secret cannot be empty",
            ));
        }
    }

    if auth.scope_claim.is_empty() {
        errors.push(err("auth", "scope_claim", "claim name cannot be empty"));
    }
}

fn validate_policy(config: &Config, errors: &mut Vec<ValidationError>) {
    for (i, rule) in config.policy.iter().enumerate() {
        if let Err(msg) = validate_scope_pattern(&rule.scope) {
            errors.push(err("policy", format!("[{i}].scope"), msg));
        }
    }
}

fn validate_retry(config: &Config, errors: &mut Vec<ValidationError>) {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        errors.push(ValidationError {
            suggestion: Some("use 1 to disable retries".into()),
            ..err("retry", "max_attempts", "must be at least 1")
        });
    } else if retry.max_attempts > MAX_RETRY_ATTEMPTS {
        errors.push(ValidationError {
            suggestion: Some(format!(
                "use at most {MAX_RETRY_ATTEMPTS}; raise max_backoff_ms to wait longer instead"
            )),
            ..err(
                "retry",
                "max_attempts",
                format!(
                    "{} attempts exceeds the limit of {MAX_RETRY_ATTEMPTS}",
                    retry.max_attempts
                ),
            )
        });
    }
    if retry.base_backoff_ms > retry.max_backoff_ms {
        errors.push(err(
            "retry",
            "base_backoff_ms",
            format!(
                "base backoff {}ms exceeds max backoff {}ms",
                retry.base_backoff_ms, retry.max_backoff_ms
            ),
        ));
    }
}

fn validate_defaults(config: &Config, errors: &mut Vec<ValidationError>) {
    let rules = &config.defaults.headers;
    for (name, value) in &rules.add {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(err(
                "defaults",
                "headers.add",
                format!("'{name}' is not a valid header name"),
            ));
        }
        if HeaderValue::from_str(value).is_err() {
            errors.push(err(
                "defaults",
                format!("headers.add.{name}"),
                "value contains characters not allowed in a header",
            ));
        }
    }
    for name in &rules.strip {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(err(
                "defaults",
                "headers.strip",
                format!("'{name}' is not a valid header name"),
            ));
        }
    }
}

#[must_use]
pub fn format_validation_report(path: &str, config: &Config) -> String {
    let modules: BTreeSet<_> = config.modules.configured().map(|(id, _)| id).collect();
    let mut lines = vec![format!(
        "  {} modules, {} routing rules, {} policy rules, {} signing keys\n",
        modules.len(),
        config.routing.rules.len(),
        config.total_policy_rules(),
        config.auth.keys.len(),
    )];

    for (id, module) in config.modules.configured() {
        let health = module
            .health_path
            .as_deref()
            .unwrap_or_else(|| id.default_health_path());
        lines.push(format!(
            "  {id}  -> {}{}",
            module.url,
            if module.required { "" } else { " (optional)" }
        ));
        lines.push(format!("    health:  {health}"));
        lines.push(format!("    timeout: {}ms", module.timeout));
        lines.push(format!(
            "    pool:    {} connections, {}ms acquire timeout",
            module.pool.max_connections, module.pool.acquire_timeout
        ));
    }

    for rule in &config.routing.rules {
        let host = rule.host.as_deref().unwrap_or("*");
        let prefix = rule.path_prefix.as_deref().unwrap_or("/");
        lines.push(format!("  route {host}{prefix}  -> {}", rule.module));
    }

    format!("{} is valid\n{}", path, lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{
        AuthConfig, Defaults, ModuleConfig, Modules, PolicyRuleConfig, RetryConfig, Routing,
        RoutingRule, SigningKey,
    };
    use crate::module::ModuleId;
    use crate::policy::Effect;

    fn minimal_config() -> Config {
        let mut modules = Modules::default();
        modules.set(ModuleId::Metrics, ModuleConfig::new("http://prometheus:9090"));
        Config {
            modules,
            enabled: None,
            routing: Routing::default(),
            auth: AuthConfig::default(),
            policy: vec![PolicyRuleConfig {
                scope: "metrics:*".into(),
                module: ModuleId::Metrics,
                effect: Effect::Allow,
            }],
            retry: RetryConfig::default(),
            defaults: Defaults::default(),
        }
    }

    fn fields(config: &Config) -> Vec<String> {
        validate(config)
            .unwrap_err()
            .into_iter()
            .map(|e| format!("{}:{}", e.section, e.field))
            .collect()
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&minimal_config()).is_ok());
    }

    #[test]
    fn no_modules_fails() {
        let mut config = minimal_config();
        config.modules = Modules::default();
        assert_eq!(fields(&config), vec!["modules:modules"]);
    }

    #[test]
    fn bad_backend_url_fails() {
        let mut config = minimal_config();
        config.modules.set(ModuleId::Logging, ModuleConfig::new("ftp://loki"));
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors[0].field, "logging.url");
        assert!(errors[0].message.contains("unsupported scheme"));
    }

    #[test]
    fn enabled_module_must_be_configured() {
        let mut config = minimal_config();
        config.enabled = Some(vec![ModuleId::Metrics, ModuleId::Tracing]);
        assert_eq!(fields(&config), vec!["enabled:tracing"]);
    }

    #[test]
    fn zero_pool_fails() {
        let mut config = minimal_config();
        let mut module = ModuleConfig::new("http://prometheus:9090");
        module.pool.max_connections = 0;
        config.modules.set(ModuleId::Metrics, module);
        assert_eq!(fields(&config), vec!["modules:metrics.pool.max_connections"]);
    }

    #[test]
    fn rule_without_conditions_fails() {
        let mut config = minimal_config();
        config.routing.rules.push(RoutingRule {
            module: ModuleId::Metrics,
            host: None,
            path_prefix: None,
            strip_prefix: true,
        });
        assert_eq!(fields(&config), vec!["routing:rules[3]"]);
    }

    #[test]
    fn prefix_without_slash_suggests_fix() {
        let mut config = minimal_config();
        config.routing.rules = vec![RoutingRule {
            module: ModuleId::Metrics,
            host: None,
            path_prefix: Some("prom".into()),
            strip_prefix: true,
        }];
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors[0].suggestion.as_deref(), Some("did you mean '/prom'?"));
    }

    #[test]
    fn colliding_rules_for_different_modules_fail() {
        let mut config = minimal_config();
        config.routing.rules.push(RoutingRule {
            module: ModuleId::Logging,
            host: None,
            path_prefix: Some("/metrics/".into()),
            strip_prefix: true,
        });
        let errors = validate(&config).unwrap_err();
        assert!(errors[0].message.contains("same host/prefix as rules[1]"));
    }

    #[test]
    fn duplicate_key_ids_fail() {
        let mut config = minimal_config();
        let key = SigningKey {
            id: "primary".into(),
            secret: "s".into(),
            algorithm: Default::default(),
        };
        config.auth.keys = vec![key.clone(), key];
        assert_eq!(fields(&config), vec!["auth:keys[1].id"]);
    }

    #[test]
    fn empty_secret_fails() {
        let mut config = minimal_config();
        config.auth.keys = vec![SigningKey {
            id: "primary".into(),
            secret: String::new(),
            algorithm: Default::default(),
        }];
        assert_eq!(fields(&config), vec!["auth:keys[0].secret"]);
    }

    #[test]
    fn scope_patterns() {
        assert!(validate_scope_pattern("*").is_ok());
        assert!(validate_scope_pattern("metrics:*").is_ok());
        assert!(validate_scope_pattern("logs:read").is_ok());
        assert!(validate_scope_pattern("").is_err());
        assert!(validate_scope_pattern("me*trics").is_err());
        assert!(validate_scope_pattern("a b").is_err());
    }

    #[test]
    fn zero_attempts_fails() {
        let mut config = minimal_config();
        config.retry.max_attempts = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors[0].suggestion.as_deref(), Some("use 1 to disable retries"));
    }

    #[test]
    fn attempts_above_ceiling_fail() {
        let mut config = minimal_config();
        config.retry.max_attempts = MAX_RETRY_ATTEMPTS;
        assert!(validate(&config).is_ok());

        config.retry.max_attempts = MAX_RETRY_ATTEMPTS + 1;
        assert_eq!(fields(&config), vec!["retry:max_attempts"]);
        let errors = validate(&config).unwrap_err();
        assert!(errors[0].suggestion.as_deref().unwrap().contains("at most 10"));
    }

    #[test]
    fn bad_header_rules_fail() {
        let mut config = minimal_config();
        config
            .defaults
            .headers
            .add
            .insert("bad header".into(), "v".into());
        config.defaults.headers.strip.push("also bad".into());
        assert_eq!(
            fields(&config),
            vec!["defaults:headers.add", "defaults:headers.strip"]
        );
    }

    #[test]
    fn report_lists_modules_and_routes() {
        let report = format_validation_report("watchtower.yaml", &minimal_config());
        assert!(report.starts_with("watchtower.yaml is valid"));
        assert!(report.contains("metrics  -> http://prometheus:9090"));
        assert!(report.contains("health:  /-/healthy"));
        assert!(report.contains("route */tracing  -> tracing"));
    }
}
