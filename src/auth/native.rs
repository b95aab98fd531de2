// Direct exchange against the identity provider

use anyhow::Context;

use super::flow::FlowContext;
use super::types::TokenResponse;
use crate::error::Result;

/// Authorization-code flow against the identity provider itself. Supports silent refresh.
#[derive(Debug, Clone)]
pub struct NativeFlow {
    context: FlowContext,
}

impl NativeFlow {
    pub fn new(context: FlowContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &FlowContext {
        &self.context
    }

    /// Consent URL. Offline access plus a forced consent prompt guarantee a refresh token.
    pub fn authorization_url(&self, redirect_uri: &str, scopes: &[&str], state: &str) -> Result<String> {
        let settings = &self.context.settings;
        let url = reqwest::Url::parse_with_params(
            &settings.authorization_url,
            &[
                ("client_id", settings.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scopes.join(" ").as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .context("Invalid authorization URL")?;
        Ok(url.into())
    }

    /// The full response is returned so the bundled ID token is not lost
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenResponse> {
        tracing::debug!("Exchanging authorization code with identity provider");
        self.context.exchange_authorization_code(code, redirect_uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::SqliteCredentialStore;
    use crate::auth::provider::ProviderSettings;
    use crate::auth::types::{ClientSecrets, USER_SCOPES};
    use crate::clock::SystemClock;
    use crate::http_client::ServiceHttpClient;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_authorization_url_params() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = ClientSecrets {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            auth_uri: None,
            token_uri: None,
            redirect_uris: vec![],
        };
        let flow = NativeFlow::new(FlowContext {
            settings: Arc::new(ProviderSettings::native(&secrets)),
            http: ServiceHttpClient::with_client(reqwest::Client::new(), 0),
            store: Arc::new(SqliteCredentialStore::open(dir.path()).unwrap()),
            clock: Arc::new(SystemClock),
        });

        let url = flow
            .authorization_url("http://localhost:4321/Callback", USER_SCOPES, "xyz")
            .unwrap();
        let parsed = reqwest::Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("accounts.google.com"));

        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["redirect_uri"], "http://localhost:4321/Callback");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "openid email profile");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["state"], "xyz");
    }
}
