//! Bearer-token credential validation.
//!
//! [`CredentialValidator`] turns the `Authorization` header of an inbound
//! request into a [`Principal`] or an [`AuthFailure`]. Tokens are
//! HMAC-signed JWTs checked against a cached table of trusted keys
//! selected by the token's `kid`. Anything ambiguous or partial is
//! rejected rather than guessed at.

use std::collections::{BTreeSet, HashMap, HashSet};

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::config::model::{AuthConfig, KeyAlgorithm};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: String,
    pub scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("missing credential")]
    MissingCredential,
    #[error("malformed credential")]
    Malformed,
    #[error("credential expired")]
    Expired,
    #[error("invalid credential signature")]
    SignatureInvalid,
    #[error("credential revoked")]
    Revoked,
}

impl AuthFailure {
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Malformed => "malformed",
            Self::Expired => "expired",
            Self::SignatureInvalid => "signature_invalid",
            Self::Revoked => "revoked",
        }
    }
}

struct TrustedKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

pub struct CredentialValidator {
    keys: HashMap<String, TrustedKey>,
    issuer: Option<String>,
    audience: Option<String>,
    leeway: u64,
    scope_claim: String,
    revoked: HashSet<String>,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut key_ids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        key_ids.sort_unstable();
        f.debug_struct("CredentialValidator")
            .field("keys", &key_ids)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("revoked", &self.revoked.len())
            .finish_non_exhaustive()
    }
}

const fn to_algorithm(alg: KeyAlgorithm) -> Algorithm {
    match alg {
        KeyAlgorithm::HS256 => Algorithm::HS256,
        KeyAlgorithm::HS384 => Algorithm::HS384,
        KeyAlgorithm::HS512 => Algorithm::HS512,
    }
}

impl CredentialValidator {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .map(|k| {
                (
                    k.id.clone(),
                    TrustedKey {
                        key: DecodingKey::from_secret(k.secret.as_bytes()),
                        algorithm: to_algorithm(k.algorithm),
                    },
                )
            })
            .collect();

        Self {
            keys,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway: config.leeway,
            scope_claim: config.scope_claim.clone(),
            revoked: config.revoked.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Authenticate a request from its headers.
    pub fn validate(&self, headers: &HeaderMap) -> Result<Principal, AuthFailure> {
        let token = extract_bearer(headers)?;
        self.validate_token(token)
    }

    pub fn validate_token(&self, token: &str) -> Result<Principal, AuthFailure> {
        let result = self.decode(token);
        if let Err(failure) = result {
            tracing::debug!(reason = failure.reason(), "credential rejected");
        }
        result
    }

    fn decode(&self, token: &str) -> Result<Principal, AuthFailure> {
        if token.split('.').count() != 3 {
            return Err(AuthFailure::Malformed);
        }

        let header = jsonwebtoken::decode_header(token).map_err(|_| AuthFailure::Malformed)?;
        let trusted = self.select_key(header.kid.as_deref())?;

        let mut validation = Validation::new(trusted.algorithm);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(ref iss) = self.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(ref aud) = self.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }

        let data = jsonwebtoken::decode::<Value>(token, &trusted.key, &validation)
            .map_err(|e| classify(e.kind()))?;
        let claims = data.claims;

        let identity = match claims.get("sub") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(AuthFailure::Malformed),
        };

        let jti = claims.get("jti").and_then(Value::as_str);
        if self.revoked.contains(&identity) || jti.is_some_and(|j| self.revoked.contains(j)) {
            return Err(AuthFailure::Revoked);
        }

        let scopes = parse_scopes(claims.get(&self.scope_claim))?;

        Ok(Principal { identity, scopes })
    }

    fn select_key(&self, kid: Option<&str>) -> Result<&TrustedKey, AuthFailure> {
        match kid {
            Some(kid) => self.keys.get(kid).ok_or(AuthFailure::SignatureInvalid),
            None if self.keys.len() == 1 => {
                self.keys.values().next().ok_or(AuthFailure::SignatureInvalid)
            }
            // No keys at all cannot verify anything; several keys without a
            // `kid` is ambiguous.
            None if self.keys.is_empty() => Err(AuthFailure::SignatureInvalid),
            None => Err(AuthFailure::Malformed),
        }
    }
}

/// Pull the bearer token out of exactly one `Authorization` header.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthFailure> {
    let mut values = headers.get_all(AUTHORIZATION).iter();
    let Some(value) = values.next() else {
        return Err(AuthFailure::MissingCredential);
    };
    if values.next().is_some() {
        return Err(AuthFailure::Malformed);
    }

    let value = value.to_str().map_err(|_| AuthFailure::Malformed)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthFailure::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthFailure::Malformed);
    }
    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(AuthFailure::Malformed);
    }
    Ok(token)
}

fn classify(kind: &ErrorKind) -> AuthFailure {
    match kind {
        ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => AuthFailure::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::InvalidSubject
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthFailure::Malformed,
        _ => AuthFailure::SignatureInvalid,
    }
}

fn parse_scopes(claim: Option<&Value>) -> Result<BTreeSet<String>, AuthFailure> {
    match claim {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(String::from).ok_or(AuthFailure::Malformed))
            .collect(),
        Some(_) => Err(AuthFailure::Malformed),
    }
}
