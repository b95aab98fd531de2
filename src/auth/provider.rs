// Provider endpoints and client registration

use anyhow::{Context, Result};
use std::path::Path;

use super::types::{ClientSecrets, ClientSecretsFile, ProviderKind};

const NATIVE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub(crate) const NATIVE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const NATIVE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Redirect used by installed apps when the user copies the code by hand
const OUT_OF_BAND_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

/// The auth proxy pre-registers this callback, so browser logins must listen here
pub const PROXY_CALLBACK_HOST: &str = "localhost";
pub const PROXY_CALLBACK_PORT: u16 = 3000;

/// Everything a flow needs to talk to one provider
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub token_url: String,
    pub revoke_url: String,

    /// Redirect URI announced in manual mode
    pub manual_redirect_uri: String,

    /// Callback listener address for browser mode (port 0 picks a free port)
    pub callback_host: String,
    pub callback_port: u16,
}

impl ProviderSettings {
    /// Settings for direct exchange with the identity provider
    pub fn native(secrets: &ClientSecrets) -> Self {
        Self {
            kind: ProviderKind::Native,
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            authorization_url: secrets
                .auth_uri
                .clone()
                .unwrap_or_else(|| NATIVE_AUTH_URL.to_string()),
            token_url: secrets
                .token_uri
                .clone()
                .unwrap_or_else(|| NATIVE_TOKEN_URL.to_string()),
            revoke_url: NATIVE_REVOKE_URL.to_string(),
            manual_redirect_uri: secrets
                .redirect_uris
                .first()
                .cloned()
                .unwrap_or_else(|| OUT_OF_BAND_REDIRECT.to_string()),
            callback_host: "localhost".to_string(),
            callback_port: 0,
        }
    }

    /// Settings for the auth proxy living at `domain`
    pub fn proxy(secrets: &ClientSecrets, domain: &str) -> Self {
        let base = proxy_base_url(domain);
        Self {
            kind: ProviderKind::Proxy,
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            authorization_url: format!("{}/authorize", base),
            token_url: format!("{}/oauth/token", base),
            revoke_url: format!("{}/v2/logout", base),
            manual_redirect_uri: proxy_redirect_uri(),
            callback_host: PROXY_CALLBACK_HOST.to_string(),
            callback_port: PROXY_CALLBACK_PORT,
        }
    }

    /// Build settings from a client secrets file for the chosen provider
    pub fn load(kind: ProviderKind, secrets_file: &Path, proxy_domain: Option<&str>) -> Result<Self> {
        let secrets = read_client_secrets(secrets_file)?;
        match kind {
            ProviderKind::Native => Ok(Self::native(&secrets)),
            ProviderKind::Proxy => {
                let domain = proxy_domain
                    .filter(|d| !d.is_empty())
                    .context("An auth proxy domain is required for the proxy provider")?;
                Ok(Self::proxy(&secrets, domain))
            }
        }
    }
}

/// Redirect URI registered with the auth proxy
pub fn proxy_redirect_uri() -> String {
    format!("http://{}:{}", PROXY_CALLBACK_HOST, PROXY_CALLBACK_PORT)
}

/// Domains may be configured bare or with a scheme
fn proxy_base_url(domain: &str) -> String {
    let domain = domain.trim_end_matches('/');
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("https://{}", domain)
    }
}

/// Load the OAuth client registration
pub fn read_client_secrets(path: &Path) -> Result<ClientSecrets> {
    tracing::debug!("Reading client secrets file: {}", path.display());
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read client secrets file: {}", path.display()))?;
    let file: ClientSecretsFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse client secrets file: {}", path.display()))?;
    Ok(file.installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn secrets() -> ClientSecrets {
        ClientSecrets {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            auth_uri: None,
            token_uri: Some("https://example.test/token".to_string()),
            redirect_uris: vec![],
        }
    }

    #[test]
    fn test_native_defaults() {
        let settings = ProviderSettings::native(&secrets());
        assert_eq!(settings.kind, ProviderKind::Native);
        assert_eq!(settings.authorization_url, NATIVE_AUTH_URL);
        assert_eq!(settings.token_url, "https://example.test/token");
        assert_eq!(settings.revoke_url, NATIVE_REVOKE_URL);
        assert_eq!(settings.manual_redirect_uri, OUT_OF_BAND_REDIRECT);
        assert_eq!(settings.callback_port, 0);
    }

    #[test]
    fn test_proxy_endpoints() {
        let settings = ProviderSettings::proxy(&secrets(), "tenant.auth.example.com");
        assert_eq!(settings.kind, ProviderKind::Proxy);
        assert_eq!(
            settings.authorization_url,
            "https://tenant.auth.example.com/authorize"
        );
        assert_eq!(
            settings.token_url,
            "https://tenant.auth.example.com/oauth/token"
        );
        assert_eq!(
            settings.revoke_url,
            "https://tenant.auth.example.com/v2/logout"
        );
        assert_eq!(settings.manual_redirect_uri, "http://localhost:3000");
        assert_eq!(settings.callback_port, PROXY_CALLBACK_PORT);
    }

    #[test]
    fn test_proxy_domain_with_scheme() {
        let settings = ProviderSettings::proxy(&secrets(), "http://127.0.0.1:9999/");
        assert_eq!(settings.token_url, "http://127.0.0.1:9999/oauth/token");
    }

    #[test]
    fn test_load_requires_proxy_domain() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"installed": {{"client_id": "id", "client_secret": "s"}}}}"#
        )
        .unwrap();

        assert!(ProviderSettings::load(ProviderKind::Proxy, file.path(), None).is_err());
        assert!(ProviderSettings::load(ProviderKind::Proxy, file.path(), Some("")).is_err());

        let native = ProviderSettings::load(ProviderKind::Native, file.path(), None).unwrap();
        assert_eq!(native.client_id, "id");
    }

    #[test]
    fn test_missing_secrets_file() {
        let result = read_client_secrets(Path::new("/nonexistent/client_secret.json"));
        assert!(result.is_err());
    }
}
