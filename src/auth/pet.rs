// Pet service-account keys: fetch from the key-issuing service and cache on disk

use anyhow::Context;
use std::path::{Path, PathBuf};

use super::types::{PetCredential, ServiceAccountKey};
use crate::context::{pet_key_dir, pet_key_file, write_atomic, UserIdentity};
use crate::error::{AuthError, Result};
use crate::http_client::ServiceHttpClient;

/// Fetches pet keys and caches them per user and scope. A cached key is reused
/// until logout removes it; there is no rotation.
#[derive(Debug, Clone)]
pub struct PetCredentialFetcher {
    http: ServiceHttpClient,
    key_service_url: Option<String>,
    context_dir: PathBuf,
}

impl PetCredentialFetcher {
    pub fn new(http: ServiceHttpClient, key_service_url: Option<String>, context_dir: &Path) -> Self {
        Self {
            http,
            key_service_url,
            context_dir: context_dir.to_path_buf(),
        }
    }

    pub fn cache_file(&self, user: &UserIdentity, scope: &str) -> PathBuf {
        pet_key_file(&self.context_dir, user, scope)
    }

    /// Load a cached key, `None` if it was never fetched
    pub fn cached(&self, user: &UserIdentity, scope: &str) -> Result<Option<PetCredential>> {
        let path = self.cache_file(user, scope);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read cached pet key: {}", path.display()))
                    .into())
            }
        };

        let key: ServiceAccountKey = serde_json::from_str(&contents).with_context(|| {
            format!(
                "Cached pet key is corrupt, log out and back in to replace it: {}",
                path.display()
            )
        })?;

        tracing::debug!(scope, path = %path.display(), "Using cached pet key");
        Ok(Some(PetCredential::new(scope, key)))
    }

    /// Return the pet credential for `scope`, asking the key-issuing service only
    /// when nothing is cached
    pub async fn fetch(
        &self,
        user: &UserIdentity,
        scope: &str,
        access_token: &str,
    ) -> Result<PetCredential> {
        if let Some(pet) = self.cached(user, scope)? {
            return Ok(pet);
        }

        let body = self.request_key(scope, access_token).await?;
        let key: ServiceAccountKey = serde_json::from_str(&body)
            .context("Key service returned a malformed service account key")?;

        let path = self.cache_file(user, scope);
        write_atomic(&path, body.as_bytes())
            .with_context(|| format!("Failed to cache pet key: {}", path.display()))?;

        tracing::info!(scope, email = %key.client_email, "Fetched pet service account key");
        Ok(PetCredential::new(scope, key))
    }

    async fn request_key(&self, scope: &str, access_token: &str) -> Result<String> {
        let base = self.key_service_url.as_deref().ok_or_else(|| {
            AuthError::UserActionable(
                "No key service URL configured. Set WB_KEY_SERVICE_URL or pass --key-service-url."
                    .to_string(),
            )
        })?;

        let url = key_endpoint(base, scope)?;
        let request = self
            .http
            .client()
            .get(url)
            .bearer_auth(access_token)
            .build()
            .context("Failed to build pet key request")?;

        let response = self
            .http
            .request_with_retry(request)
            .await
            .map_err(|e| match e {
                AuthError::Remote { status, message } => AuthError::KeyService { status, message },
                other => other,
            })?;

        let body = response
            .text()
            .await
            .context("Failed to read pet key response")?;
        Ok(body)
    }

    /// Remove every cached key for `user`. A missing cache directory is fine.
    pub fn delete_all(&self, user: &UserIdentity) -> Result<()> {
        let dir = pet_key_dir(&self.context_dir, user);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(path = %dir.display(), "Deleted cached pet keys");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to delete cached pet keys: {}", dir.display()))
                .into()),
        }
    }
}

/// `<base>/api/google/v1/user/petServiceAccount/<scope>/key`
fn key_endpoint(base: &str, scope: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base)
        .with_context(|| format!("Invalid key service URL: {}", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Key service URL cannot be a base: {}", base))?
        .pop_if_empty()
        .extend(["api", "google", "v1", "user", "petServiceAccount", scope, "key"]);
    Ok(url)
}
