// Token refresh logic

use anyhow::{Context, Result};
use chrono::Duration;
use reqwest::Client;
use std::sync::Arc;

use super::credentials::{
    CredentialStore, CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY, ID_TOKENS_NAMESPACE,
    ID_TOKEN_STORE_KEY,
};
use super::provider::ProviderSettings;
use super::types::{
    needs_refresh, IdToken, ProviderKind, ProxyRefreshResponse, TokenResponse, UserCredential,
};
use crate::clock::Clock;

/// Refresh using the identity provider's token endpoint
pub async fn refresh_native(
    client: &Client,
    settings: &ProviderSettings,
    refresh_token: &str,
) -> Result<TokenResponse> {
    tracing::info!("Refreshing access token via identity provider...");

    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", settings.client_id.as_str()),
        ("client_secret", settings.client_secret.as_str()),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(&settings.token_url)
        .form(&form)
        .send()
        .await
        .context("Failed to send refresh request to identity provider")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();

        // OAuth2 error bodies carry a code and a description
        if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&error_text) {
            if let (Some(error_code), Some(error_desc)) = (
                error_json.get("error").and_then(|v| v.as_str()),
                error_json.get("error_description").and_then(|v| v.as_str()),
            ) {
                tracing::debug!(
                    "Identity provider refresh error details: error={}, description={}",
                    error_code,
                    error_desc
                );
            }
        }

        anyhow::bail!("Identity provider refresh failed: {} - {}", status, error_text);
    }

    let data: TokenResponse = response
        .json()
        .await
        .context("Failed to parse identity provider refresh response")?;

    if data.access_token.is_empty() {
        anyhow::bail!("Identity provider response does not contain access_token");
    }

    Ok(data)
}

/// Refresh using the auth proxy's token endpoint. Tokens issued by the proxy
/// cannot be refreshed through the identity provider, so this is a plain form POST.
pub async fn refresh_proxy(
    client: &Client,
    settings: &ProviderSettings,
    refresh_token: &str,
) -> Result<ProxyRefreshResponse> {
    tracing::info!("Refreshing access token via auth proxy...");

    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", settings.client_id.as_str()),
        ("client_secret", settings.client_secret.as_str()),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(&settings.token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .form(&form)
        .send()
        .await
        .context("Failed to send refresh request to auth proxy")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Auth proxy refresh failed: {} - {}", status, error_text);
    }

    let data: ProxyRefreshResponse = response
        .json()
        .await
        .context("Failed to parse auth proxy refresh response")?;

    if data.access_token.is_empty() {
        anyhow::bail!("Auth proxy response does not contain access_token");
    }

    Ok(data)
}

/// Keeps a user credential usable, refreshing through the configured provider
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    client: Client,
    settings: Arc<ProviderSettings>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,

    /// Refresh this long before the recorded expiry
    skew: Duration,
}

impl TokenRefresher {
    pub fn new(
        client: Client,
        settings: Arc<ProviderSettings>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        skew: Duration,
    ) -> Self {
        Self {
            client,
            settings,
            store,
            clock,
            skew,
        }
    }

    /// Whether the credential is inside the refresh window
    pub fn needs_refresh(&self, credential: &UserCredential) -> bool {
        needs_refresh(credential.expiry_time, self.clock.now(), self.skew)
    }

    /// Return a credential that is valid now if at all possible.
    ///
    /// Fresh credentials and credentials without a refresh token come back
    /// unchanged with no network call. A failed refresh is logged and the original,
    /// possibly expired, credential is returned; downstream services will reject it
    /// if it really is unusable.
    pub async fn ensure_valid(&self, credential: &UserCredential) -> UserCredential {
        if !self.needs_refresh(credential) {
            return credential.clone();
        }

        if !credential.can_refresh() {
            tracing::debug!("Access token expiring but no refresh token is stored; skipping refresh");
            return credential.clone();
        }

        match self.refresh(credential).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!("Error refreshing access token: {:#}", e);
                credential.clone()
            }
        }
    }

    /// Refresh unconditionally and persist the result
    pub async fn refresh(&self, credential: &UserCredential) -> Result<UserCredential> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .context("Credential has no refresh token")?;

        let mut updated = credential.clone();
        let mut id_token = None;

        match self.settings.kind {
            ProviderKind::Native => {
                let data = refresh_native(&self.client, &self.settings, refresh_token).await?;
                updated.expiry_time = data.expiry_from(self.clock.now());
                updated.access_token = data.access_token;
                if let Some(rotated) = data.refresh_token.filter(|t| !t.is_empty()) {
                    updated.refresh_token = Some(rotated);
                }
                id_token = data
                    .id_token
                    .map(|raw| IdToken::from_raw(raw, updated.expiry_time));
            }
            ProviderKind::Proxy => {
                let data = refresh_proxy(&self.client, &self.settings, refresh_token).await?;
                updated.expiry_time =
                    self.clock.now() + Duration::seconds(data.expires_in.unwrap_or(3600));
                updated.access_token = data.access_token;
            }
        }

        self.store
            .put_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY, &updated)
            .context("Failed to persist refreshed credential")?;

        if let Some(ref id_token) = id_token {
            self.store
                .put_record(ID_TOKENS_NAMESPACE, ID_TOKEN_STORE_KEY, id_token)
                .context("Failed to persist refreshed ID token")?;
        }

        tracing::info!(
            "Access token refreshed, expires: {}",
            updated.expiry_time.to_rfc3339()
        );

        Ok(updated)
    }
}
