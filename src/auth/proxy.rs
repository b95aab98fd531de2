// Code exchange delegated to the auth proxy

use anyhow::Context;

use super::flow::FlowContext;
use super::types::TokenResponse;
use crate::error::Result;

/// Scope the proxy needs before it will issue a refresh token
const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

/// Authorization-code flow through a third-party auth proxy. The proxy pre-registers a
/// fixed callback, and its token response already carries the ID token.
#[derive(Debug, Clone)]
pub struct ProxyFlow {
    context: FlowContext,
}

impl ProxyFlow {
    pub fn new(context: FlowContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &FlowContext {
        &self.context
    }

    pub fn authorization_url(&self, redirect_uri: &str, scopes: &[&str], state: &str) -> Result<String> {
        let settings = &self.context.settings;

        let mut scope: Vec<&str> = scopes.to_vec();
        if !scope.contains(&OFFLINE_ACCESS_SCOPE) {
            scope.push(OFFLINE_ACCESS_SCOPE);
        }

        let url = reqwest::Url::parse_with_params(
            &settings.authorization_url,
            &[
                ("response_type", "code"),
                ("client_id", settings.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.join(" ").as_str()),
                ("state", state),
            ],
        )
        .context("Invalid auth proxy authorization URL")?;
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenResponse> {
        tracing::debug!("Exchanging authorization code with auth proxy");
        self.context.exchange_authorization_code(code, redirect_uri).await
    }
}
