// Authorization code receivers: local callback server and manual paste

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    Router,
};
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use super::provider::ProviderSettings;
use super::types::{LoginMode, ProviderKind};
use crate::error::{AuthError, Result};

const SUCCESS_PAGE: &str =
    "<html><body><h1>Login Successful</h1><p>You can close this window and return to the terminal.</p></body></html>";
const FAILURE_PAGE: &str =
    "<html><body><h1>Login Failed</h1><p>You can close this window and return to the terminal.</p></body></html>";

/// Query parameters the provider appends to the redirect URI
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Where the authorization code comes from
pub enum CodeReceiver {
    LocalServer(LocalServerReceiver),
    Manual(ManualReceiver),
}

impl CodeReceiver {
    /// Default receiver for a login mode. Application default credentials need no code.
    pub fn for_mode(
        mode: LoginMode,
        settings: &ProviderSettings,
        landing_page: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let receiver = match mode {
            LoginMode::Browser => {
                let mut receiver = LocalServerReceiver::new(&settings.callback_host, settings.callback_port)
                    .callback_path(callback_path(settings.kind))
                    .timeout(timeout);
                if let Some(page) = landing_page {
                    receiver = receiver.landing_page(page);
                }
                CodeReceiver::LocalServer(receiver)
            }
            LoginMode::Manual => CodeReceiver::Manual(
                ManualReceiver::stdin(settings.manual_redirect_uri.clone()).timeout(timeout),
            ),
            LoginMode::AppDefaultCredentials => {
                return Err(anyhow::anyhow!(
                    "Application default credentials login does not receive an authorization code"
                )
                .into())
            }
        };
        Ok(receiver)
    }

    /// Get ready to receive a code. The returned handle knows the redirect URI.
    pub async fn start(self) -> Result<PendingCode> {
        match self {
            CodeReceiver::LocalServer(receiver) => Ok(PendingCode::Callback(receiver.start().await?)),
            CodeReceiver::Manual(receiver) => Ok(PendingCode::Manual(receiver)),
        }
    }
}

/// Native clients register a `/Callback` path; the proxy calls back on the root
fn callback_path(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Native => "/Callback",
        ProviderKind::Proxy => "",
    }
}

/// A receiver that has been started and is ready to present the authorization URL
pub enum PendingCode {
    Callback(PendingCallback),
    Manual(ManualReceiver),
}

impl PendingCode {
    pub fn redirect_uri(&self) -> &str {
        match self {
            PendingCode::Callback(pending) => &pending.redirect_uri,
            PendingCode::Manual(receiver) => &receiver.redirect_uri,
        }
    }

    /// Show the user the authorization URL and wait for the code
    pub async fn complete(self, authorization_url: &str, expected_state: &str) -> Result<String> {
        match self {
            PendingCode::Callback(pending) => pending.complete(authorization_url, expected_state).await,
            PendingCode::Manual(receiver) => receiver.complete(authorization_url, expected_state).await,
        }
    }
}

/// Listens on a local port for the provider's redirect
#[derive(Debug, Clone)]
pub struct LocalServerReceiver {
    host: String,
    port: u16,
    path: String,
    landing_page: Option<String>,
    timeout: Option<Duration>,
    open_browser: bool,
}

impl LocalServerReceiver {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            path: String::new(),
            landing_page: None,
            timeout: None,
            open_browser: true,
        }
    }

    pub fn callback_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Redirect the browser here once the code has been received
    pub fn landing_page(mut self, url: impl Into<String>) -> Self {
        self.landing_page = Some(url.into());
        self
    }

    /// `None` waits forever
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Print the authorization URL instead of launching a browser
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    /// Bind the listener and serve the callback route until a code arrives
    pub async fn start(self) -> Result<PendingCallback> {
        let ipv4 = TcpListener::bind((Ipv4Addr::LOCALHOST, self.port))
            .await
            .with_context(|| format!("Failed to bind login callback listener on port {}", self.port))?;
        let port = ipv4
            .local_addr()
            .context("Failed to read login callback listener address")?
            .port();

        // `localhost` in the redirect may resolve to ::1 first
        let ipv6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 loopback unavailable for login callback");
                None
            }
        };

        let redirect_uri = format!("http://{}:{}{}", self.host, port, self.path);
        tracing::debug!(redirect_uri = %redirect_uri, "Login callback listener started");

        let (code_tx, code_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(CallbackState {
            sender: Mutex::new(Some(code_tx)),
            landing_page: self.landing_page,
        });
        let app = Router::new().fallback(handle_callback).with_state(state);

        for listener in std::iter::once(ipv4).chain(ipv6) {
            let app = app.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    })
                    .await
                    .ok();
            });
        }

        Ok(PendingCallback {
            redirect_uri,
            receiver: code_rx,
            shutdown: shutdown_tx,
            timeout: self.timeout,
            open_browser: self.open_browser,
        })
    }
}

/// A running callback listener
pub struct PendingCallback {
    redirect_uri: String,
    receiver: oneshot::Receiver<CallbackParams>,
    shutdown: watch::Sender<bool>,
    timeout: Option<Duration>,
    open_browser: bool,
}

impl PendingCallback {
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub async fn complete(self, authorization_url: &str, expected_state: &str) -> Result<String> {
        let PendingCallback {
            receiver,
            shutdown,
            timeout,
            open_browser,
            ..
        } = self;

        if open_browser {
            open_in_browser(authorization_url);
        } else {
            eprintln!(
                "\nPlease open the following address in a browser on this machine:\n\n    {}\n",
                authorization_url
            );
        }

        let received = with_login_timeout(timeout, receiver).await?;

        // Dropping the sender also stops the server; sending is just quicker
        let _ = shutdown.send(true);

        let params = received
            .map_err(|_| AuthError::System(anyhow::anyhow!("Login callback listener stopped unexpectedly")))?;
        validate_callback(params, expected_state)
    }
}

struct CallbackState {
    sender: Mutex<Option<oneshot::Sender<CallbackParams>>>,
    landing_page: Option<String>,
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    // Browsers also ask for /favicon.ico and friends
    if params.code.is_none() && params.error.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let failed = params.error.is_some();
    let sender = state.sender.lock().ok().and_then(|mut guard| guard.take());
    match sender {
        Some(tx) => {
            let _ = tx.send(params);
        }
        None => return (StatusCode::GONE, "Login already completed").into_response(),
    }

    if failed {
        return Html(FAILURE_PAGE).into_response();
    }
    match &state.landing_page {
        Some(url) => Redirect::to(url).into_response(),
        None => Html(SUCCESS_PAGE).into_response(),
    }
}

/// Reads a pasted code (or the full redirect URL) from an input stream
pub struct ManualReceiver {
    redirect_uri: String,
    input: Box<dyn BufRead + Send>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ManualReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualReceiver")
            .field("redirect_uri", &self.redirect_uri)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ManualReceiver {
    /// Read the code from standard input
    pub fn stdin(redirect_uri: impl Into<String>) -> Self {
        Self::with_input(redirect_uri, std::io::BufReader::new(std::io::stdin()))
    }

    pub fn with_input(redirect_uri: impl Into<String>, input: impl BufRead + Send + 'static) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            input: Box::new(input),
            timeout: None,
        }
    }

    /// `None` waits forever
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn complete(self, authorization_url: &str, expected_state: &str) -> Result<String> {
        eprintln!(
            "Please open the following address in a browser on any machine:\n\n    {}\n",
            authorization_url
        );
        eprint!("Enter the authorization code: ");
        std::io::stderr().flush().ok();

        // A detached thread, so an abandoned read never holds up runtime shutdown
        let mut input = self.input;
        let (line_tx, line_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("auth-code-reader".to_string())
            .spawn(move || {
                let mut line = String::new();
                let _ = line_tx.send(input.read_line(&mut line).map(|n| (n, line)));
            })
            .context("Failed to start authorization code reader")?;

        let (bytes, line) = with_login_timeout(self.timeout, line_rx)
            .await?
            .map_err(|_| anyhow::anyhow!("Authorization code reader stopped unexpectedly"))?
            .context("Failed to read authorization code")?;

        if bytes == 0 || line.trim().is_empty() {
            return Err(AuthError::UserActionable(
                "No authorization code was entered".to_string(),
            ));
        }

        validate_callback(parse_pasted_input(&line)?, expected_state)
    }
}

async fn with_login_timeout<F: std::future::Future>(
    timeout: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| AuthError::UserActionable("login timed out".to_string())),
        None => Ok(future.await),
    }
}

/// Try to open the URL; fall back to printing it
fn open_in_browser(url: &str) {
    eprintln!("\nYour browser has been opened to visit:\n\n    {}\n", url);
    if let Err(e) = webbrowser::open(url) {
        tracing::debug!(error = %e, "failed to open browser");
        eprintln!("Could not open a browser. Please open the address above manually.");
    }
}

/// Accept a bare code, a full redirect URL, or a query string containing `code=`
pub fn parse_pasted_input(input: &str) -> Result<CallbackParams> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AuthError::UserActionable(
            "No authorization code was entered".to_string(),
        ));
    }

    let url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Some(reqwest::Url::parse(trimmed).context("Invalid redirect URL")?)
    } else if let Some(query) = trimmed.strip_prefix('?') {
        Some(reqwest::Url::parse(&format!("http://localhost/?{}", query)).context("Invalid redirect query")?)
    } else if trimmed.contains("code=") || trimmed.contains("error=") {
        Some(reqwest::Url::parse(&format!("http://localhost/?{}", trimmed)).context("Invalid redirect query")?)
    } else {
        None
    };

    let Some(url) = url else {
        return Ok(CallbackParams {
            code: Some(trimmed.to_string()),
            ..Default::default()
        });
    };

    let mut params = CallbackParams::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => params.code = Some(value.into_owned()),
            "state" => params.state = Some(value.into_owned()),
            "error" => params.error = Some(value.into_owned()),
            _ => {}
        }
    }

    if params.code.is_none() && params.error.is_none() {
        return Err(AuthError::UserActionable(
            "The pasted address does not contain an authorization code".to_string(),
        ));
    }
    Ok(params)
}

/// Turn callback parameters into a code, checking the anti-forgery state when present
fn validate_callback(params: CallbackParams, expected_state: &str) -> Result<String> {
    if let Some(error) = params.error {
        return Err(AuthError::UserActionable(format!(
            "Authorization was not granted: {}",
            error
        )));
    }

    if let Some(state) = params.state.as_deref() {
        if state != expected_state {
            return Err(AuthError::UserActionable(
                "OAuth state mismatch, please try logging in again.".to_string(),
            ));
        }
    }

    params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| {
            AuthError::UserActionable("Authorization response did not include a code".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_bare_code() {
        let params = parse_pasted_input("  4/0AbCdEf  \n").unwrap();
        assert_eq!(params.code.as_deref(), Some("4/0AbCdEf"));
        assert_eq!(params.state, None);
    }

    #[test]
    fn test_parse_redirect_url() {
        let params =
            parse_pasted_input("http://localhost:3000/?code=abc%2F123&state=xyz").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc/123"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_parse_query_string() {
        let params = parse_pasted_input("code=abc&state=xyz").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));

        let params = parse_pasted_input("?error=access_denied").unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
    }

    #[test]
    fn test_parse_url_without_code() {
        assert!(parse_pasted_input("https://example.test/?foo=bar").is_err());
        assert!(parse_pasted_input("   ").is_err());
    }

    #[test]
    fn test_validate_callback() {
        let ok = CallbackParams {
            code: Some("c".to_string()),
            state: Some("s".to_string()),
            error: None,
        };
        assert_eq!(validate_callback(ok.clone(), "s").unwrap(), "c");
        assert!(validate_callback(ok, "other").is_err());

        let denied = CallbackParams {
            error: Some("access_denied".to_string()),
            ..Default::default()
        };
        let err = validate_callback(denied, "s").unwrap_err();
        assert!(err.is_user_actionable());
    }

    #[tokio::test]
    async fn test_manual_receiver_reads_code() {
        let receiver = ManualReceiver::with_input("urn:ietf:wg:oauth:2.0:oob", Cursor::new("the-code\n"));
        let code = receiver
            .complete("https://auth.example.test/authorize", "state")
            .await
            .unwrap();
        assert_eq!(code, "the-code");
    }

    #[tokio::test]
    async fn test_manual_receiver_empty_input() {
        let receiver = ManualReceiver::with_input("urn:ietf:wg:oauth:2.0:oob", Cursor::new(""));
        let err = receiver
            .complete("https://auth.example.test/authorize", "state")
            .await
            .unwrap_err();
        assert!(err.is_user_actionable());
    }

    #[tokio::test]
    async fn test_local_server_receives_code() {
        let pending = LocalServerReceiver::new("127.0.0.1", 0)
            .callback_path("/Callback")
            .timeout(Some(Duration::from_secs(10)))
            .without_browser()
            .start()
            .await
            .unwrap();

        let redirect_uri = pending.redirect_uri().to_string();
        assert!(redirect_uri.starts_with("http://127.0.0.1:"));
        assert!(redirect_uri.ends_with("/Callback"));

        let waiter = tokio::spawn(async move {
            pending
                .complete("https://auth.example.test/authorize", "state-1")
                .await
        });

        let response = reqwest::get(format!("{}?code=X&state=state-1", redirect_uri))
            .await
            .unwrap();
        assert!(response.status().is_success());

        assert_eq!(waiter.await.unwrap().unwrap(), "X");
    }

    #[tokio::test]
    async fn test_local_server_ignores_requests_without_code() {
        let pending = LocalServerReceiver::new("127.0.0.1", 0)
            .timeout(Some(Duration::from_secs(10)))
            .without_browser()
            .start()
            .await
            .unwrap();
        let redirect_uri = pending.redirect_uri().to_string();

        let waiter = tokio::spawn(async move { pending.complete("https://auth.example.test", "s").await });

        let favicon = reqwest::get(format!("{}/favicon.ico", redirect_uri)).await.unwrap();
        assert_eq!(favicon.status(), reqwest::StatusCode::NOT_FOUND);

        reqwest::get(format!("{}/?code=Y", redirect_uri)).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "Y");
    }

    #[tokio::test]
    async fn test_local_server_answers_on_both_loopbacks() {
        let pending = LocalServerReceiver::new("localhost", 0)
            .timeout(Some(Duration::from_secs(10)))
            .without_browser()
            .start()
            .await
            .unwrap();
        let port = reqwest::Url::parse(pending.redirect_uri())
            .unwrap()
            .port()
            .unwrap();
        assert_eq!(pending.redirect_uri(), format!("http://localhost:{}", port));

        let waiter = tokio::spawn(async move { pending.complete("https://auth.example.test", "s").await });

        if std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_ok() {
            let stray = reqwest::get(format!("http://[::1]:{}/favicon.ico", port))
                .await
                .unwrap();
            assert_eq!(stray.status(), reqwest::StatusCode::NOT_FOUND);
        }

        reqwest::get(format!("http://127.0.0.1:{}/?code=Z", port))
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "Z");
    }

    #[tokio::test]
    async fn test_local_server_times_out() {
        let pending = LocalServerReceiver::new("127.0.0.1", 0)
            .timeout(Some(Duration::from_millis(50)))
            .without_browser()
            .start()
            .await
            .unwrap();

        let err = pending
            .complete("https://auth.example.test", "s")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "login timed out");
    }

    /// Input that takes a long time to produce anything
    struct StalledInput(Duration);

    impl std::io::Read for StalledInput {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.0);
            Ok(0)
        }
    }

    #[test]
    fn test_manual_timeout_lets_runtime_shut_down() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let started = std::time::Instant::now();

        let receiver = ManualReceiver::with_input(
            "urn:ietf:wg:oauth:2.0:oob",
            std::io::BufReader::new(StalledInput(Duration::from_secs(6))),
        )
        .timeout(Some(Duration::from_millis(100)));

        let err = runtime
            .block_on(receiver.complete("https://auth.example.test/authorize", "s"))
            .unwrap_err();
        assert_eq!(err.to_string(), "login timed out");

        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_bare_codes_pass_through(code in "[A-Za-z0-9/_.-]{1,64}") {
            let params = parse_pasted_input(&code).unwrap();
            prop_assert_eq!(params.code, Some(code));
        }

        #[test]
        fn prop_codes_survive_url_encoding(code in "[A-Za-z0-9/+=_.-]{1,64}") {
            let mut url = reqwest::Url::parse("http://localhost:3000/").unwrap();
            url.query_pairs_mut().append_pair("code", &code).append_pair("state", "s");
            let params = parse_pasted_input(url.as_str()).unwrap();
            prop_assert_eq!(params.code, Some(code));
        }
    }
}
