use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::adc::AppDefaultCredentials;
use super::credentials::{
    CredentialStore, SqliteCredentialStore, CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY,
    ID_TOKENS_NAMESPACE, ID_TOKEN_STORE_KEY,
};
use super::flow::{AuthorizationFlow, FlowContext};
use super::pet::PetCredentialFetcher;
use super::provider::ProviderSettings;
use super::receiver::CodeReceiver;
use super::refresh::TokenRefresher;
use super::types::{IdToken, LoginMode, PetCredential, UserCredential, USER_SCOPES};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::context::{Session, UserIdentity, WorkspaceScope};
use crate::error::{AuthError, Result};
use crate::http_client::ServiceHttpClient;

/// Where the current invocation stands in the login lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
    NeedsRefresh,
}

/// Tunables for the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Refresh this long before the recorded expiry
    pub refresh_skew: Duration,

    /// `None` waits forever for the authorization code
    pub login_timeout: Option<std::time::Duration>,

    /// Browser is redirected here after a successful callback
    pub landing_page: Option<String>,

    /// Used when the session has no remembered login mode
    pub default_mode: LoginMode,

    pub key_service_url: Option<String>,

    /// Application default credentials file; `None` uses the gcloud location
    pub adc_file: Option<PathBuf>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            refresh_skew: Duration::seconds(60),
            login_timeout: Some(std::time::Duration::from_secs(300)),
            landing_page: None,
            default_mode: LoginMode::Browser,
            key_service_url: None,
            adc_file: None,
        }
    }
}

impl From<&Config> for ManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            refresh_skew: Duration::seconds(config.token_refresh_skew as i64),
            login_timeout: match config.login_timeout {
                0 => None,
                secs => Some(std::time::Duration::from_secs(secs)),
            },
            landing_page: config.login_landing_page.clone(),
            default_mode: config.login_mode,
            key_service_url: config.key_service_url.clone(),
            adc_file: config.adc_file.clone(),
        }
    }
}

/// Snapshot reported by `status`
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub logged_in: bool,
    pub state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_mode: Option<LoginMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<UserIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token_expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceScope>,
}

/// Credential manager
/// Orchestrates login, logout, refresh and pet credentials for one CLI invocation
pub struct CredentialManager {
    /// Current user and workspace
    session: Arc<RwLock<Session>>,

    /// Provider integration
    flow: AuthorizationFlow,

    refresher: TokenRefresher,

    pets: PetCredentialFetcher,

    adc: AppDefaultCredentials,

    /// Durable credential records, shared with the flow and refresher
    store: Arc<dyn CredentialStore>,

    clock: Arc<dyn Clock>,

    state: Arc<RwLock<AuthState>>,

    options: ManagerOptions,
}

impl CredentialManager {
    /// Create a manager from its parts. The credential store lives in the session's directory.
    pub fn new(
        settings: ProviderSettings,
        session: Session,
        http: ServiceHttpClient,
        clock: Arc<dyn Clock>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let store: Arc<dyn CredentialStore> = Arc::new(SqliteCredentialStore::open(session.store_dir())?);
        let settings = Arc::new(settings);

        let flow = AuthorizationFlow::new(FlowContext {
            settings: settings.clone(),
            http: http.clone(),
            store: store.clone(),
            clock: clock.clone(),
        });
        let refresher = TokenRefresher::new(
            http.client().clone(),
            settings,
            store.clone(),
            clock.clone(),
            options.refresh_skew,
        );
        let adc = AppDefaultCredentials::new(options.adc_file.clone(), http.clone(), clock.clone());
        let pets = PetCredentialFetcher::new(http, options.key_service_url.clone(), session.dir());

        let manager = Self {
            session: Arc::new(RwLock::new(session)),
            flow,
            refresher,
            pets,
            adc,
            store,
            clock,
            state: Arc::new(RwLock::new(AuthState::LoggedOut)),
            options,
        };
        manager.init_state()?;
        Ok(manager)
    }

    /// Create a manager from loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        tracing::info!(
            provider = ?config.provider,
            context_dir = %config.context_dir.display(),
            "Loading credential manager"
        );

        let settings = ProviderSettings::load(
            config.provider,
            &config.client_secrets_file,
            config.auth_proxy_domain.as_deref(),
        )?;
        let http = ServiceHttpClient::new(
            config.http_connect_timeout,
            config.http_request_timeout,
            config.http_max_retries,
        )?;
        let session = Session::load(&config.context_dir);

        Self::new(
            settings,
            session,
            http,
            Arc::new(SystemClock),
            ManagerOptions::from(config),
        )
    }

    /// Derive the starting state from what is on disk
    fn init_state(&self) -> Result<()> {
        let has_user = self
            .session
            .try_read()
            .map(|session| session.user().is_some())
            .unwrap_or(false);

        let initial = match (has_user, self.load_credential()?) {
            (true, Some(credential)) if self.refresher.needs_refresh(&credential) => {
                AuthState::NeedsRefresh
            }
            (true, Some(_)) => AuthState::LoggedIn,
            _ => AuthState::LoggedOut,
        };

        if let Ok(mut state) = self.state.try_write() {
            *state = initial;
        }
        Ok(())
    }

    pub async fn state(&self) -> AuthState {
        *self.state.read().await
    }

    async fn set_state(&self, next: AuthState) {
        let mut state = self.state.write().await;
        let previous = *state;
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Auth state transition");
            *state = next;
        }
    }

    fn load_credential(&self) -> Result<Option<UserCredential>> {
        Ok(self
            .store
            .get_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY)?)
    }

    fn load_id_token(&self) -> Result<Option<IdToken>> {
        Ok(self.store.get_record(ID_TOKENS_NAMESPACE, ID_TOKEN_STORE_KEY)?)
    }

    /// How the current user logged in, falling back to the configured default
    pub async fn login_mode(&self) -> LoginMode {
        self.session
            .read()
            .await
            .login_mode()
            .unwrap_or(self.options.default_mode)
    }

    /// Log in with `mode`. Application default credentials are loaded directly;
    /// the other modes use their default code receiver.
    pub async fn login(&self, mode: LoginMode) -> Result<()> {
        if mode == LoginMode::AppDefaultCredentials {
            return self.login_app_default().await;
        }

        let tokens = self.flow.login(
            USER_SCOPES,
            mode,
            self.options.landing_page.clone(),
            self.options.login_timeout,
        );
        self.complete_login(mode, tokens).await
    }

    /// Log in again the way the current user last did
    pub async fn login_default(&self) -> Result<()> {
        self.login(self.login_mode().await).await
    }

    /// Log in using an explicit code receiver. A no-op when stored credentials are still good.
    pub async fn login_with(&self, receiver: CodeReceiver) -> Result<()> {
        let mode = match receiver {
            CodeReceiver::LocalServer(_) => LoginMode::Browser,
            CodeReceiver::Manual(_) => LoginMode::Manual,
        };
        self.complete_login(mode, self.flow.login_with(receiver, USER_SCOPES))
            .await
    }

    /// Load gcloud application default credentials in place of an interactive login.
    /// They are always reloaded, never reused from the store.
    async fn login_app_default(&self) -> Result<()> {
        let tokens = async {
            let (credential, id_token) = self.adc.load().await?;
            self.flow.store_tokens(&credential, &id_token)?;
            Ok::<_, AuthError>((credential, id_token))
        };
        self.complete_login(LoginMode::AppDefaultCredentials, tokens)
            .await
    }

    /// Shared by every login mode
    async fn complete_login<F>(&self, mode: LoginMode, acquire: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<(UserCredential, IdToken)>>,
    {
        if mode.is_interactive() && self.reuse_existing().await? {
            tracing::info!("Already logged in, reusing stored credentials");
            return Ok(());
        }

        self.set_state(AuthState::LoggingIn).await;

        let (credential, _id_token) = match acquire.await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.set_state(AuthState::LoggedOut).await;
                return Err(e);
            }
        };

        let user = {
            let mut session = self.session.write().await;
            let user = match session.user() {
                Some(user) => user.clone(),
                None => {
                    let user = UserIdentity::generate(self.clock.now());
                    tracing::info!(user = %user.key, "Created local user identity");
                    session.set_user(user.clone());
                    user
                }
            };
            session.set_login_mode(mode);
            session.save()?;
            user
        };

        self.set_state(AuthState::LoggedIn).await;
        self.fetch_pet_for_active_workspace(&user, &credential.access_token)
            .await;
        Ok(())
    }

    /// Stored credentials are reusable when, after an implicit refresh, both the
    /// access token and ID token outlive the refresh skew. Credentials from
    /// application default credentials are never reused for an interactive login.
    async fn reuse_existing(&self) -> Result<bool> {
        {
            let session = self.session.read().await;
            if session.user().is_none()
                || session.login_mode() == Some(LoginMode::AppDefaultCredentials)
            {
                return Ok(false);
            }
        }

        let Some((credential, _)) = self.flow.get_existing()? else {
            return Ok(false);
        };

        let credential = self.refresher.ensure_valid(&credential).await;
        let id_token = self.load_id_token()?;

        let threshold = self.clock.now() + self.options.refresh_skew;
        let reusable = credential.expiry_time > threshold
            && id_token.is_some_and(|token| token.expiry_time > threshold);

        if reusable {
            self.set_state(AuthState::LoggedIn).await;
        } else {
            tracing::info!("Stored credentials need reauthentication");
        }
        Ok(reusable)
    }

    /// Failures here must not fail the login
    async fn fetch_pet_for_active_workspace(&self, user: &UserIdentity, access_token: &str) {
        let scope = {
            let session = self.session.read().await;
            session.workspace().map(|w| w.pet_scope().to_string())
        };
        let Some(scope) = scope else {
            return;
        };

        match self.pets.fetch(user, &scope, access_token).await {
            Ok(pet) => tracing::info!(scope = %scope, email = %pet.email(), "Pet credential ready"),
            Err(e) => {
                tracing::error!(scope = %scope, "Error fetching pet credential during login: {}", e);
                eprintln!("Error fetching pet service account key for {}: {}", scope, e);
            }
        }
    }

    /// Revoke and delete everything for the current user. Always ends logged out.
    /// Tokens minted from application default credentials belong to gcloud and are not revoked.
    pub async fn logout(&self) {
        if self.login_mode().await.is_interactive() {
            self.flow.logout().await;
        } else {
            self.flow.discard_tokens();
        }

        let mut session = self.session.write().await;
        if let Some(user) = session.user().cloned() {
            if let Err(e) = self.pets.delete_all(&user) {
                tracing::warn!("Failed to delete cached pet keys: {}", e);
            }
        }

        session.clear_user();
        if let Err(e) = session.save() {
            tracing::warn!("Failed to save session after logout: {:#}", e);
        }
        drop(session);

        self.set_state(AuthState::LoggedOut).await;
        tracing::info!("Logged out");
    }

    /// The logged-in identity, or a login-required error
    pub async fn require_current_user(&self) -> Result<UserIdentity> {
        self.session
            .read()
            .await
            .user()
            .cloned()
            .ok_or_else(AuthError::login_required)
    }

    /// Get a usable access token, refreshing if necessary.
    /// A failed implicit refresh still hands back the stale token.
    pub async fn get_access_token(&self) -> Result<String> {
        self.require_current_user().await?;
        let credential = self.load_credential()?.ok_or_else(AuthError::login_required)?;

        if !self.refresher.needs_refresh(&credential) {
            self.set_state(AuthState::LoggedIn).await;
            return Ok(credential.access_token);
        }

        self.set_state(AuthState::NeedsRefresh).await;
        let refreshed = match self.login_mode().await {
            LoginMode::AppDefaultCredentials => self.reload_app_default(&credential).await,
            _ => self.refresher.ensure_valid(&credential).await,
        };

        if refreshed == credential {
            tracing::warn!("Access token could not be refreshed, using the stored token");
            self.set_state(AuthState::LoggedOut).await;
        } else {
            self.set_state(AuthState::LoggedIn).await;
        }

        Ok(refreshed.access_token)
    }

    /// Application default credentials renew by loading them again, never through the
    /// provider's refresh endpoint. Failures keep the stored credential.
    async fn reload_app_default(&self, credential: &UserCredential) -> UserCredential {
        let reloaded = match self.adc.load().await {
            Ok((credential, id_token)) => self
                .flow
                .store_tokens(&credential, &id_token)
                .map(|_| credential),
            Err(e) => Err(e),
        };

        reloaded.unwrap_or_else(|e| {
            tracing::warn!("Error reloading application default credentials: {}", e);
            credential.clone()
        })
    }

    /// Get the raw ID token. ID tokens only renew alongside the access token,
    /// so the access token is checked first.
    pub async fn get_id_token(&self) -> Result<String> {
        self.get_access_token().await?;

        let id_token = self.load_id_token()?.ok_or_else(AuthError::login_required)?;
        if id_token.is_expired(self.clock.now()) {
            return Err(AuthError::UserActionable(
                "ID Token expired, please try your command again.".to_string(),
            ));
        }
        Ok(id_token.raw_token)
    }

    pub async fn status(&self) -> Result<AuthStatus> {
        let (identity, workspace, login_mode) = {
            let session = self.session.read().await;
            (
                session.user().cloned(),
                session.workspace().cloned(),
                session.login_mode(),
            )
        };

        let (credential, id_token) = if identity.is_some() {
            (self.load_credential()?, self.load_id_token()?)
        } else {
            (None, None)
        };

        let logged_in = identity.is_some() && credential.is_some() && id_token.is_some();

        Ok(AuthStatus {
            logged_in,
            state: self.state().await,
            login_mode: login_mode.filter(|_| identity.is_some()),
            identity,
            email: id_token.as_ref().and_then(|t| t.claims.email.clone()),
            access_token_expiry: credential.map(|c| c.expiry_time),
            id_token_expiry: id_token.map(|t| t.expiry_time),
            workspace,
        })
    }

    /// Pet credential for `scope`, or for the active workspace when `None`
    pub async fn fetch_pet_credential(&self, scope: Option<&str>) -> Result<PetCredential> {
        let user = self.require_current_user().await?;

        let scope = match scope {
            Some(scope) => scope.to_string(),
            None => self
                .session
                .read()
                .await
                .workspace()
                .map(|w| w.pet_scope().to_string())
                .ok_or_else(|| {
                    AuthError::UserActionable(
                        "No workspace is set. Run `workspace set` or pass --scope.".to_string(),
                    )
                })?,
        };

        // Cached keys need no access token
        if let Some(pet) = self.pets.cached(&user, &scope)? {
            return Ok(pet);
        }

        let access_token = self.get_access_token().await?;
        self.pets.fetch(&user, &scope, &access_token).await
    }

    pub async fn set_workspace(&self, workspace: WorkspaceScope) -> Result<()> {
        let mut session = self.session.write().await;
        tracing::info!(workspace = %workspace.id, "Setting active workspace");
        session.set_workspace(workspace);
        session.save().context("Failed to save active workspace")?;
        Ok(())
    }

    pub async fn clear_workspace(&self) -> Result<()> {
        let mut session = self.session.write().await;
        session.clear_workspace();
        session.save().context("Failed to clear active workspace")?;
        Ok(())
    }

    pub async fn workspace(&self) -> Option<WorkspaceScope> {
        self.session.read().await.workspace().cloned()
    }
}
