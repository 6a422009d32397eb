//! Registry authentication.
//!
//! [`AuthTransport`] wraps a `reqwest::Client` for one registry host. Requests
//! carry whatever authorization is cached; a `401` with a `WWW-Authenticate`
//! challenge triggers at most one negotiation and one retry.

use std::collections::BTreeSet;
use std::sync::Arc;

use hoist_core::error::{HoistError, Result};
use http_auth::{parser::ChallengeParser, ChallengeRef};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::credentials::{CredentialProvider, Credentials};

/// OAuth2 client id presented when exchanging identity tokens.
const CLIENT_ID: &str = "hoist";

/// A token scope such as `repository:org/app:pull,push`.
///
/// Several space-separated entries may be combined in one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope(String);

impl Scope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a token granted for `self` also authorizes `requested`.
    pub fn covers(&self, requested: &Scope) -> bool {
        if self.0 == requested.0 {
            return true;
        }
        requested.0.split_whitespace().all(|wanted| {
            self.0
                .split_whitespace()
                .any(|granted| entry_covers(granted, wanted))
        })
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split `type:name:actions`. The name may itself contain colons.
fn parse_scope_entry(entry: &str) -> Option<(&str, &str, BTreeSet<&str>)> {
    let (rest, actions) = entry.rsplit_once(':')?;
    let (kind, name) = rest.split_once(':')?;
    if kind.is_empty() || name.is_empty() {
        return None;
    }
    Some((kind, name, actions.split(',').filter(|a| !a.is_empty()).collect()))
}

fn entry_covers(granted: &str, requested: &str) -> bool {
    match (parse_scope_entry(granted), parse_scope_entry(requested)) {
        (Some((g_kind, g_name, g_actions)), Some((r_kind, r_name, r_actions))) => {
            g_kind == r_kind
                && g_name == r_name
                && (g_actions.contains("*") || r_actions.is_subset(&g_actions))
        }
        _ => granted == requested,
    }
}

/// Parameters of a `Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<Scope>,
}

/// The challenge a registry answered a `401` with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer(BearerChallenge),
    /// Unsupported scheme, by name.
    Other(String),
}

impl TryFrom<&ChallengeRef<'_>> for BearerChallenge {
    type Error = String;

    fn try_from(value: &ChallengeRef<'_>) -> std::result::Result<Self, Self::Error> {
        if !value.scheme.eq_ignore_ascii_case("Bearer") {
            return Err(format!("not a bearer challenge: {}", value.scheme));
        }
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (k, v) in &value.params {
            if k.eq_ignore_ascii_case("realm") {
                realm = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("service") {
                service = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("scope") {
                scope = Some(Scope::new(v.to_unescaped()));
            }
        }
        let realm = realm.ok_or("missing required parameter realm")?;
        Ok(BearerChallenge {
            realm,
            service,
            scope,
        })
    }
}

/// Parse a `WWW-Authenticate` header value.
///
/// A usable Bearer challenge wins over Basic; anything else is reported by
/// scheme name. Returns `None` when no challenge can be parsed at all.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let mut fallback = None;
    for challenge in ChallengeParser::new(header).flatten() {
        if challenge.scheme.eq_ignore_ascii_case("Bearer") {
            match BearerChallenge::try_from(&challenge) {
                Ok(bearer) => return Some(Challenge::Bearer(bearer)),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed bearer challenge"),
            }
        } else if challenge.scheme.eq_ignore_ascii_case("Basic") {
            fallback = Some(Challenge::Basic);
        } else if fallback.is_none() {
            fallback = Some(Challenge::Other(challenge.scheme.to_string()));
        }
    }
    fallback
}

/// What a host has authorized us with so far.
#[derive(Clone, Default)]
enum AuthState {
    #[default]
    Empty,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
        scope: Option<Scope>,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Authenticating decorator around an HTTP client, scoped to one registry host.
pub struct AuthTransport {
    client: Client,
    registry: String,
    credentials: Arc<dyn CredentialProvider>,
    state: Mutex<AuthState>,
}

impl AuthTransport {
    pub fn new(
        client: Client,
        registry: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            registry: registry.into(),
            credentials,
            state: Mutex::new(AuthState::Empty),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Scope of the cached bearer token, if any.
    pub async fn granted_scope(&self) -> Option<Scope> {
        match &*self.state.lock().await {
            AuthState::Bearer { scope, .. } => scope.clone(),
            _ => None,
        }
    }

    /// Send a request built by `build`, negotiating credentials on a `401`.
    ///
    /// `build` is called again for the retry, so bodies must be produced
    /// fresh on every call. A `401` that cannot be resolved is returned to
    /// the caller as-is.
    pub async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let response = self.authorize(build(&self.client)?).await.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);

        let renegotiated = match challenge {
            Some(Challenge::Basic) => self.negotiate_basic().await,
            Some(Challenge::Bearer(ref bearer)) => self.negotiate_bearer(bearer).await?,
            Some(Challenge::Other(ref scheme)) => {
                tracing::debug!(registry = %self.registry, scheme = %scheme, "Unsupported auth scheme");
                false
            }
            None => false,
        };
        if !renegotiated {
            return Ok(response);
        }

        tracing::debug!(registry = %self.registry, "Retrying request with new credentials");
        Ok(self.authorize(build(&self.client)?).await.send().await?)
    }

    async fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &*self.state.lock().await {
            AuthState::Empty => builder,
            AuthState::Basic { username, password } => builder.basic_auth(username, Some(password)),
            AuthState::Bearer { token, .. } => builder.bearer_auth(token),
        }
    }

    /// Cache Basic credentials once. A second Basic challenge is final.
    async fn negotiate_basic(&self) -> bool {
        let mut state = self.state.lock().await;
        if matches!(*state, AuthState::Basic { .. }) {
            return false;
        }
        match self.credentials.get_credentials(&self.registry) {
            Some(Credentials::Basic { username, password }) => {
                tracing::debug!(registry = %self.registry, "Using basic credentials");
                *state = AuthState::Basic { username, password };
                true
            }
            _ => false,
        }
    }

    /// Fetch a token unless the cached one already covers the requested scope.
    async fn negotiate_bearer(&self, challenge: &BearerChallenge) -> Result<bool> {
        let mut state = self.state.lock().await;
        if let AuthState::Bearer { ref scope, .. } = *state {
            let covered = match (scope, &challenge.scope) {
                (None, None) => true,
                (Some(granted), Some(requested)) => granted.covers(requested),
                // A scope-less token and a scoped one are not interchangeable
                (Some(_), None) | (None, Some(_)) => false,
            };
            if covered {
                tracing::debug!(
                    registry = %self.registry,
                    scope = ?challenge.scope,
                    "Cached token already covers requested scope"
                );
                return Ok(false);
            }
        }

        let token = self.fetch_token(challenge).await?;
        tracing::debug!(registry = %self.registry, scope = ?challenge.scope, "Obtained bearer token");
        *state = AuthState::Bearer {
            token,
            scope: challenge.scope.clone(),
        };
        Ok(true)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let credentials = self.credentials.get_credentials(&self.registry);
        let service = challenge.service.as_deref();
        let scope = challenge.scope.as_ref().map(Scope::as_str);

        let request = match credentials {
            Some(Credentials::IdentityToken(ref refresh_token)) => {
                let mut form = vec![
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("client_id", CLIENT_ID),
                ];
                form.extend(service.map(|s| ("service", s)));
                form.extend(scope.map(|s| ("scope", s)));
                self.client.post(&challenge.realm).form(&form)
            }
            basic => {
                let mut query = Vec::new();
                query.extend(service.map(|s| ("service", s)));
                query.extend(scope.map(|s| ("scope", s)));
                let builder = self.client.get(&challenge.realm).query(&query);
                match basic {
                    Some(Credentials::Basic { username, password }) => {
                        builder.basic_auth(username, Some(password))
                    }
                    _ => builder,
                }
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.auth_error(format!(
                "token endpoint {} returned {}: {}",
                challenge.realm, status, body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_error(format!("malformed token response: {}", e)))?;
        body.token
            .filter(|t| !t.is_empty())
            .or(body.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| self.auth_error("token response carries no token".to_string()))
    }

    fn auth_error(&self, message: String) -> HoistError {
        HoistError::Auth {
            registry: self.registry.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/app:pull""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer(BearerChallenge {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
                scope: Some(Scope::new("repository:org/app:pull")),
            })
        );
    }

    #[test]
    fn test_parse_basic_challenge() {
        assert_eq!(
            parse_challenge(r#"Basic realm="Registry Realm""#),
            Some(Challenge::Basic)
        );
    }

    #[test]
    fn test_bearer_preferred_over_basic() {
        let challenge =
            parse_challenge(r#"Basic realm="x", Bearer realm="https://auth.example.com/token""#)
                .unwrap();
        assert!(matches!(challenge, Challenge::Bearer(_)));
    }

    #[test]
    fn test_bearer_without_realm_is_unusable() {
        assert_eq!(parse_challenge(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_other_scheme() {
        assert_eq!(
            parse_challenge(r#"Negotiate realm="x""#),
            Some(Challenge::Other("Negotiate".to_string()))
        );
    }

    #[test]
    fn test_scope_covers_subset() {
        let granted = Scope::new("repository:org/app:pull,push");
        assert!(granted.covers(&Scope::new("repository:org/app:pull")));
        assert!(granted.covers(&Scope::new("repository:org/app:push,pull")));
        assert!(!granted.covers(&Scope::new("repository:org/app:pull,push,delete")));
        assert!(!granted.covers(&Scope::new("repository:org/other:pull")));
    }

    #[test]
    fn test_scope_broader_is_not_covered() {
        let pull = Scope::new("repository:org/app:pull");
        assert!(!pull.covers(&Scope::new("repository:org/app:pull,push")));
    }

    #[test]
    fn test_scope_multiple_entries() {
        let granted = Scope::new("repository:org/app:pull,push repository:org/base:pull");
        assert!(granted.covers(&Scope::new("repository:org/base:pull repository:org/app:push")));
        assert!(!granted.covers(&Scope::new("repository:org/base:push")));
    }

    #[test]
    fn test_scope_wildcard_and_registry_port_names() {
        let granted = Scope::new("repository:localhost:5000/app:*");
        assert!(granted.covers(&Scope::new("repository:localhost:5000/app:pull,push")));
    }

    #[test]
    fn test_scope_unparseable_uses_equality() {
        let granted = Scope::new("registry:catalog");
        assert!(!granted.covers(&Scope::new("registry:other")));
        assert!(granted.covers(&Scope::new("registry:catalog")));
    }
}
