// Application default credentials left behind by `gcloud auth application-default login`

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::provider::NATIVE_TOKEN_URL;
use super::types::{IdToken, TokenResponse, UserCredential};
use crate::clock::Clock;
use crate::error::{AuthError, Result};
use crate::http_client::ServiceHttpClient;

/// Where gcloud writes end-user application default credentials, relative to the home directory
pub const ADC_RELATIVE_PATH: &str = ".config/gcloud/application_default_credentials.json";

/// Only end-user ADC carry a refresh token we can exchange for an ID token
const AUTHORIZED_USER: &str = "authorized_user";

/// Contents of an application default credentials file
#[derive(Debug, Clone, Deserialize)]
pub struct AdcFile {
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// `~/.config/gcloud/application_default_credentials.json`
pub fn default_adc_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(ADC_RELATIVE_PATH))
}

fn not_defined() -> AuthError {
    AuthError::UserActionable(
        "Application default credentials are not defined. Run `gcloud auth application-default login`"
            .to_string(),
    )
}

/// Loads user tokens from application default credentials instead of an interactive login
#[derive(Debug, Clone)]
pub struct AppDefaultCredentials {
    path: Option<PathBuf>,
    http: ServiceHttpClient,
    clock: Arc<dyn Clock>,
}

impl AppDefaultCredentials {
    /// `path` overrides the gcloud default location
    pub fn new(path: Option<PathBuf>, http: ServiceHttpClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.or_else(default_adc_file),
            http,
            clock,
        }
    }

    /// Read the credentials file. A missing file asks the user to create it with gcloud.
    pub fn read(&self) -> Result<AdcFile> {
        let path = self.path.as_ref().ok_or_else(not_defined)?;
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No application default credentials file");
                return Err(not_defined());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read {}", path.display()))
                    .into())
            }
        };

        let adc: AdcFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if adc.credential_type != AUTHORIZED_USER {
            return Err(AuthError::UserActionable(format!(
                "Application default credentials of type '{}' are not supported. Run `gcloud auth application-default login`",
                adc.credential_type
            )));
        }
        Ok(adc)
    }

    /// Exchange the ADC refresh token for a fresh access token and ID token
    pub async fn load(&self) -> Result<(UserCredential, IdToken)> {
        let adc = self.read()?;

        let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            adc.client_id.filter(|s| !s.is_empty()),
            adc.client_secret.filter(|s| !s.is_empty()),
            adc.refresh_token.filter(|s| !s.is_empty()),
        ) else {
            return Err(not_defined());
        };

        let token_uri = adc.token_uri.as_deref().unwrap_or(NATIVE_TOKEN_URL);
        tracing::info!("Loading application default credentials");

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];
        let request = self
            .http
            .client()
            .post(token_uri)
            .form(&form)
            .build()
            .context("Failed to build application default credentials request")?;

        let response: TokenResponse = self
            .http
            .request_with_retry(request)
            .await?
            .json()
            .await
            .context("Failed to parse application default credentials token response")?;

        if response.access_token.is_empty() {
            return Err(anyhow::anyhow!("Token response does not contain access_token").into());
        }

        let expiry_time = response.expiry_from(self.clock.now());
        let raw_id_token = response
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthError::System(anyhow::anyhow!(
                    "Could not obtain ID Token from Application Default Credentials."
                ))
            })?;

        let credential = UserCredential {
            client_id,
            client_secret,
            access_token: response.access_token,
            expiry_time,
            refresh_token: Some(response.refresh_token.unwrap_or(refresh_token)),
        };
        Ok((credential, IdToken::from_raw(raw_id_token, expiry_time)))
    }
}
