// Authentication types

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Scopes requested for the end-user credential
pub const USER_SCOPES: &[&str] = &["openid", "email", "profile"];

/// Scopes attached to pet service-account credentials. Pets also need the cloud
/// platform scope to talk to cloud APIs directly.
pub const PET_SCOPES: &[&str] = &[
    "openid",
    "email",
    "profile",
    "https://www.googleapis.com/auth/cloud-platform",
];

/// Which OAuth2 provider integration issues the user credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Direct authorization-code exchange against the identity provider
    Native,

    /// Code exchange delegated to a third-party auth proxy
    Proxy,
}

/// How the user logs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    /// Open a browser and listen on a local callback server
    Browser,

    /// Print the URL and read the code from standard input
    Manual,

    /// Reuse gcloud application default credentials; no authorization code at all
    AppDefaultCredentials,
}

impl LoginMode {
    /// Whether tokens come from the configured provider's authorization-code flow
    pub fn is_interactive(self) -> bool {
        !matches!(self, LoginMode::AppDefaultCredentials)
    }
}

/// End-user OAuth2 credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub expiry_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl UserCredential {
    /// Without a refresh token the credential cannot be silently renewed
    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }
}

/// Claims read from an ID token payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Signed identity assertion stored next to the user credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdToken {
    pub raw_token: String,
    pub expiry_time: DateTime<Utc>,
    #[serde(default)]
    pub claims: IdTokenClaims,
}

impl IdToken {
    /// Build an ID token from its raw form. The expiry comes from the `exp` claim;
    /// tokens that are not decodable JWTs inherit `fallback_expiry`.
    pub fn from_raw(raw_token: impl Into<String>, fallback_expiry: DateTime<Utc>) -> Self {
        let raw_token = raw_token.into();
        let claims = decode_claims(&raw_token).unwrap_or_else(|e| {
            tracing::debug!("ID token payload is not a decodable JWT: {:#}", e);
            IdTokenClaims::default()
        });

        let expiry_time = claims
            .exp
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
            .unwrap_or(fallback_expiry);

        Self {
            raw_token,
            expiry_time,
            claims,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }
}

/// Decode the (unverified) payload segment of a JWT
fn decode_claims(token: &str) -> Result<IdTokenClaims> {
    let payload = token
        .split('.')
        .nth(1)
        .context("token has no payload segment")?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("payload is not base64url")?;
    serde_json::from_slice(&bytes).context("payload is not a JSON claims object")
}

/// Service-account key file issued for a pet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
}

/// Per-user, per-scope service-account credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PetCredential {
    pub scope: String,
    pub key_material: ServiceAccountKey,
    pub scopes: Vec<String>,
}

impl PetCredential {
    pub fn new(scope: impl Into<String>, key_material: ServiceAccountKey) -> Self {
        Self {
            scope: scope.into(),
            key_material,
            scopes: PET_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn email(&self) -> &str {
        &self.key_material.client_email
    }
}

/// Standard OAuth2 token endpoint response, kept whole so the ID token is not lost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry of the access token. Providers that omit `expires_in` get an hour.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in.unwrap_or(3600))
    }
}

/// Auth proxy refresh response
#[derive(Debug, Deserialize)]
pub struct ProxyRefreshResponse {
    pub access_token: String,
    pub expires_in: Option<i64>,
}

/// OAuth client registration read from the client secrets file
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub auth_uri: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Client secrets JSON as downloaded from the provider console
#[derive(Debug, Deserialize)]
pub struct ClientSecretsFile {
    #[serde(alias = "web")]
    pub installed: ClientSecrets,
}

/// Whether a token expiring at `expiry` must be refreshed at `now`, given the refresh skew
pub fn needs_refresh(expiry: DateTime<Utc>, now: DateTime<Utc>, skew: Duration) -> bool {
    now >= expiry - skew
}
