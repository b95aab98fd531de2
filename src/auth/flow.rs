// Authorization-code flows for both provider variants

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

use super::credentials::{
    CredentialStore, CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY, ID_TOKENS_NAMESPACE,
    ID_TOKEN_STORE_KEY,
};
use super::native::NativeFlow;
use super::provider::ProviderSettings;
use super::proxy::ProxyFlow;
use super::receiver::CodeReceiver;
use super::types::{IdToken, LoginMode, ProviderKind, TokenResponse, UserCredential};
use crate::clock::Clock;
use crate::error::Result;
use crate::http_client::ServiceHttpClient;

/// Collaborators shared by every flow variant
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub settings: Arc<ProviderSettings>,
    pub http: ServiceHttpClient,
    pub store: Arc<dyn CredentialStore>,
    pub clock: Arc<dyn Clock>,
}

/// The provider integration, chosen once at startup
#[derive(Debug, Clone)]
pub enum AuthorizationFlow {
    Native(NativeFlow),
    Proxy(ProxyFlow),
}

impl AuthorizationFlow {
    pub fn new(context: FlowContext) -> Self {
        match context.settings.kind {
            ProviderKind::Native => AuthorizationFlow::Native(NativeFlow::new(context)),
            ProviderKind::Proxy => AuthorizationFlow::Proxy(ProxyFlow::new(context)),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            AuthorizationFlow::Native(_) => ProviderKind::Native,
            AuthorizationFlow::Proxy(_) => ProviderKind::Proxy,
        }
    }

    fn context(&self) -> &FlowContext {
        match self {
            AuthorizationFlow::Native(flow) => flow.context(),
            AuthorizationFlow::Proxy(flow) => flow.context(),
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.context().settings
    }

    /// Run an interactive login using the default receiver for `mode`
    pub async fn login(
        &self,
        scopes: &[&str],
        mode: LoginMode,
        landing_page: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<(UserCredential, IdToken)> {
        let receiver = CodeReceiver::for_mode(mode, self.settings(), landing_page, timeout)?;
        self.login_with(receiver, scopes).await
    }

    /// Run the authorization-code exchange with an explicit receiver and persist the tokens
    pub async fn login_with(
        &self,
        receiver: CodeReceiver,
        scopes: &[&str],
    ) -> Result<(UserCredential, IdToken)> {
        let pending = receiver.start().await?;
        let redirect_uri = pending.redirect_uri().to_string();
        let state = random_state();

        let authorization_url = match self {
            AuthorizationFlow::Native(flow) => flow.authorization_url(&redirect_uri, scopes, &state),
            AuthorizationFlow::Proxy(flow) => flow.authorization_url(&redirect_uri, scopes, &state),
        }?;

        tracing::info!(provider = ?self.kind(), "Waiting for authorization code");
        let code = pending.complete(&authorization_url, &state).await?;

        let response = match self {
            AuthorizationFlow::Native(flow) => flow.exchange_code(&code, &redirect_uri).await,
            AuthorizationFlow::Proxy(flow) => flow.exchange_code(&code, &redirect_uri).await,
        }?;

        let context = self.context();
        let (credential, id_token) = context.tokens_from_response(response)?;
        context.store_tokens(&credential, &id_token)?;

        tracing::info!(
            "Login complete, access token expires: {}",
            credential.expiry_time.to_rfc3339()
        );
        Ok((credential, id_token))
    }

    /// Delete the stored tokens and revoke the access token remotely.
    /// Every step is attempted independently and failures only log.
    pub async fn logout(&self) {
        let context = self.context();

        let credential: Option<UserCredential> = context
            .store
            .get_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY)
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read stored credential for revocation: {:#}", e);
                None
            });

        if let Some(credential) = credential {
            context.revoke(&credential.access_token).await;
        }

        self.discard_tokens();
    }

    /// Delete both stored records without contacting the provider
    pub fn discard_tokens(&self) {
        let context = self.context();
        for (namespace, key) in [
            (CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY),
            (ID_TOKENS_NAMESPACE, ID_TOKEN_STORE_KEY),
        ] {
            if let Err(e) = context.store.delete(namespace, key) {
                tracing::warn!("Failed to delete {}/{}: {:#}", namespace, key, e);
            }
        }
    }

    pub fn store_tokens(&self, credential: &UserCredential, id_token: &IdToken) -> Result<()> {
        self.context().store_tokens(credential, id_token)
    }

    /// Stored tokens, if they are usable without an interactive login.
    ///
    /// The credential must be unexpired or refreshable and an unexpired ID token must
    /// sit beside it. A credential without its ID token counts as absent.
    pub fn get_existing(&self) -> Result<Option<(UserCredential, IdToken)>> {
        let context = self.context();

        let Some(credential) = context
            .store
            .get_record::<UserCredential>(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY)?
        else {
            return Ok(None);
        };

        let Some(id_token) = context
            .store
            .get_record::<IdToken>(ID_TOKENS_NAMESPACE, ID_TOKEN_STORE_KEY)?
        else {
            tracing::info!("Stored credential has no ID token, a fresh login is required");
            return Ok(None);
        };

        let now = context.clock.now();
        if credential.is_expired(now) && !credential.can_refresh() {
            tracing::debug!("Stored credential expired and cannot be refreshed");
            return Ok(None);
        }
        if id_token.is_expired(now) {
            tracing::debug!("Stored ID token expired");
            return Ok(None);
        }

        Ok(Some((credential, id_token)))
    }
}

impl FlowContext {
    /// Build the credential pair from a token endpoint response
    pub fn tokens_from_response(&self, response: TokenResponse) -> Result<(UserCredential, IdToken)> {
        let expiry_time = response.expiry_from(self.clock.now());

        let raw_id_token = response
            .id_token
            .filter(|t| !t.is_empty())
            .context("Token response does not contain an id_token")?;

        let credential = UserCredential {
            client_id: self.settings.client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            access_token: response.access_token,
            expiry_time,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
        };

        if !credential.can_refresh() {
            tracing::warn!("Token response has no refresh token, re-login will be needed on expiry");
        }

        Ok((credential, IdToken::from_raw(raw_id_token, expiry_time)))
    }

    pub fn store_tokens(&self, credential: &UserCredential, id_token: &IdToken) -> Result<()> {
        self.store
            .put_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY, credential)
            .context("Failed to persist user credential")?;
        self.store
            .put_record(ID_TOKENS_NAMESPACE, ID_TOKEN_STORE_KEY, id_token)
            .context("Failed to persist ID token")?;
        Ok(())
    }

    /// POST an authorization-code grant to the token endpoint
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];

        let request = self
            .http
            .client()
            .post(&self.settings.token_url)
            .form(&form)
            .build()
            .context("Failed to build token request")?;

        let response = self.http.request_no_retry(request).await?;
        let data: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        if data.access_token.is_empty() {
            return Err(anyhow::anyhow!("Token response does not contain access_token").into());
        }
        Ok(data)
    }

    /// Best-effort revocation; only transport failures are reported, as warnings
    pub async fn revoke(&self, access_token: &str) {
        let request = match self
            .http
            .client()
            .post(&self.settings.revoke_url)
            .form(&[("token", access_token)])
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to build revocation request: {}", e);
                return;
            }
        };

        match self.http.request_no_retry(request).await {
            Ok(_) => tracing::info!("Access token revoked"),
            Err(e) => tracing::warn!("Unable to revoke access token: {}", e),
        }
    }
}

/// Anti-forgery value for the authorization request
pub(crate) fn random_state() -> String {
    let bytes: [u8; 24] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
