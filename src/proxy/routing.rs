//! Specificity-based module resolution for incoming requests.
//!
//! [`ModuleRouter::resolve`] maps request metadata to a [`ModuleId`]
//! using an explicit marker header and the configured routing rules.
//! Rules score by specificity: a host match scores highest, then each
//! matched path-prefix segment. The highest score wins; equal scores
//! naming different modules are reported as ambiguous instead of being
//! broken arbitrarily. There is no fallback module.

use axum::http::header::HOST;
use axum::http::{HeaderMap, Uri};

use crate::config::model::Routing;
use crate::module::ModuleId;

const HOST_SPECIFICITY: u32 = 1000;
const SEGMENT_SPECIFICITY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unroutable {
    #[error("no routing rule matched")]
    NoMatch,
    #[error("request matches more than one module")]
    Ambiguous,
    #[error("unknown module '{0}'")]
    UnknownModule(String),
}

impl Unroutable {
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::Ambiguous => "ambiguous",
            Self::UnknownModule(_) => "unknown_module",
        }
    }
}

/// The metadata routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub module: ModuleId,
    /// Path plus query to send to the backend.
    pub forward_path: String,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    module: ModuleId,
    host: Option<String>,
    prefix: Option<Vec<String>>,
    strip_prefix: bool,
}

#[derive(Debug, Clone)]
pub struct ModuleRouter {
    marker_header: String,
    rules: Vec<CompiledRule>,
}

impl ModuleRouter {
    #[must_use]
    pub fn from_config(routing: &Routing) -> Self {
        let rules = routing
            .rules
            .iter()
            .map(|r| CompiledRule {
                module: r.module,
                host: r.host.as_deref().map(normalize_host),
                prefix: r.path_prefix.as_deref().map(|p| {
                    segments(p.trim_end_matches('*'))
                        .map(String::from)
                        .collect()
                }),
                strip_prefix: r.strip_prefix,
            })
            .collect();

        Self {
            marker_header: routing.marker_header.to_ascii_lowercase(),
            rules,
        }
    }

    pub fn resolve_module(&self, request: RequestMeta<'_>) -> Result<ModuleId, Unroutable> {
        self.resolve(request).map(|r| r.module)
    }

    pub fn resolve(&self, request: RequestMeta<'_>) -> Result<Resolved, Unroutable> {
        let marker = self.marker(request.headers)?;
        let path = request.uri.path();
        let query = request.uri.query();

        let host = request
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(normalize_host);
        let request_segments: Vec<&str> = segments(path).collect();

        let mut best: Option<(u32, &CompiledRule)> = None;
        let mut tied = false;

        for rule in &self.rules {
            let Some(score) = score(rule, host.as_deref(), &request_segments) else {
                continue;
            };
            match best {
                Some((best_score, best_rule)) if score == best_score => {
                    if best_rule.module != rule.module {
                        tied = true;
                    }
                }
                Some((best_score, _)) if score < best_score => {}
                _ => {
                    best = Some((score, rule));
                    tied = false;
                }
            }
        }

        if tied {
            return Err(Unroutable::Ambiguous);
        }

        match (marker, best) {
            (Some(m), Some((_, rule))) if m != rule.module => Err(Unroutable::Ambiguous),
            (_, Some((_, rule))) => Ok(Resolved {
                module: rule.module,
                forward_path: forward_path(rule, &request_segments, path, query),
            }),
            (Some(m), None) => Ok(Resolved {
                module: m,
                forward_path: join_query(path.to_string(), query),
            }),
            (None, None) => Err(Unroutable::NoMatch),
        }
    }

    fn marker(&self, headers: &HeaderMap) -> Result<Option<ModuleId>, Unroutable> {
        let mut values = headers.get_all(self.marker_header.as_str()).iter();
        let Some(value) = values.next() else {
            return Ok(None);
        };
        if values.next().is_some() {
            return Err(Unroutable::Ambiguous);
        }
        let raw = value
            .to_str()
            .map_err(|_| Unroutable::UnknownModule("<non-ascii>".into()))?;
        raw.parse::<ModuleId>()
            .map(Some)
            .map_err(|e| Unroutable::UnknownModule(e.0))
    }
}

fn score(rule: &CompiledRule, host: Option<&str>, request: &[&str]) -> Option<u32> {
    let mut score = 0;

    if let Some(ref rule_host) = rule.host {
        if host != Some(rule_host.as_str()) {
            return None;
        }
        score += HOST_SPECIFICITY;
    }

    if let Some(ref prefix) = rule.prefix {
        if request.len() < prefix.len() || !prefix.iter().zip(request).all(|(p, q)| p == q) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let segments = prefix.len() as u32;
        score += segments * SEGMENT_SPECIFICITY;
    }

    Some(score)
}

fn forward_path(rule: &CompiledRule, request: &[&str], path: &str, query: Option<&str>) -> String {
    let path = match rule.prefix {
        Some(ref prefix) if rule.strip_prefix => {
            let rest = &request[prefix.len()..];
            let mut stripped = format!("/{}", rest.join("/"));
            if path.ends_with('/') && !rest.is_empty() {
                stripped.push('/');
            }
            stripped
        }
        _ => path.to_string(),
    };
    join_query(path, query)
}

fn join_query(path: String, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("{path}?{q}"),
        None => path,
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn normalize_host(host: &str) -> String {
    let without_port = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    without_port.to_ascii_lowercase()
}
