use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use crate::auth::{LoginMode, ProviderKind};

/// Workbench credential manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the credential store, session and pet key cache
    #[arg(long, env = "WB_CONTEXT_DIR", global = true)]
    pub context_dir: Option<String>,

    /// OAuth provider integration (native, proxy)
    #[arg(long, env = "WB_AUTH_PROVIDER", default_value = "native", global = true)]
    pub provider: String,

    /// Path to the OAuth client secrets JSON file
    #[arg(long, env = "WB_CLIENT_SECRETS_FILE", global = true)]
    pub client_secrets: Option<String>,

    /// Auth proxy domain (proxy provider only)
    #[arg(long, env = "WB_AUTH_PROXY_DOMAIN", global = true)]
    pub auth_proxy_domain: Option<String>,

    /// Base URL of the key-issuing service
    #[arg(long, env = "WB_KEY_SERVICE_URL", global = true)]
    pub key_service_url: Option<String>,

    /// Browser launch option (auto, manual)
    #[arg(long, env = "WB_BROWSER", default_value = "auto", global = true)]
    pub browser: String,

    /// Seconds to wait for the authorization code (0 waits forever)
    #[arg(long, env = "WB_LOGIN_TIMEOUT", default_value = "300", global = true)]
    pub login_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log in and store credentials
    Login {
        /// Login mode (browser, manual, adc); defaults to how the user last logged in
        #[arg(long)]
        mode: Option<String>,
    },

    /// Revoke and delete stored credentials
    Logout,

    /// Show the current login state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a valid access token
    AccessToken,

    /// Print the current ID token
    IdToken,

    /// Print the pet service account email for a scope
    PetKey {
        /// Project or workspace scope (defaults to the active workspace)
        #[arg(long)]
        scope: Option<String>,
    },

    /// Manage the active workspace
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorkspaceCommand {
    /// Make a workspace active
    Set {
        id: String,

        /// Cloud project backing the workspace
        #[arg(long)]
        project: Option<String>,
    },

    /// Clear the active workspace
    Clear,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Local state
    pub context_dir: PathBuf,

    // Provider
    pub provider: ProviderKind,
    pub client_secrets_file: PathBuf,
    pub auth_proxy_domain: Option<String>,
    pub key_service_url: Option<String>,

    // Login
    pub login_mode: LoginMode,
    pub login_timeout: u64,
    pub login_landing_page: Option<String>,
    pub token_refresh_skew: u64,
    pub adc_file: Option<PathBuf>,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let config = Config {
            context_dir: args
                .context_dir
                .as_deref()
                .map(expand_tilde)
                .or_else(default_context_dir)
                .context("Could not determine a context directory (use --context-dir or set WB_CONTEXT_DIR)")?,

            provider: parse_provider(&args.provider)?,

            client_secrets_file: args
                .client_secrets
                .as_deref()
                .map(expand_tilde)
                .context("WB_CLIENT_SECRETS_FILE is required (use --client-secrets or set WB_CLIENT_SECRETS_FILE env var)")?,

            auth_proxy_domain: args.auth_proxy_domain.clone().filter(|s| !s.is_empty()),
            key_service_url: args.key_service_url.clone().filter(|s| !s.is_empty()),

            login_mode: parse_browser(&args.browser),
            login_timeout: args.login_timeout,
            login_landing_page: std::env::var("WB_LOGIN_LANDING_PAGE")
                .ok()
                .filter(|s| !s.is_empty()),
            token_refresh_skew: env_or("WB_TOKEN_REFRESH_SKEW", 60),
            adc_file: std::env::var("WB_ADC_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|s| expand_tilde(&s)),

            http_connect_timeout: env_or("WB_HTTP_CONNECT_TIMEOUT", 30),
            http_request_timeout: env_or("WB_HTTP_REQUEST_TIMEOUT", 60),
            http_max_retries: env_or("WB_HTTP_MAX_RETRIES", 3),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.client_secrets_file.exists() {
            anyhow::bail!(
                "WB_CLIENT_SECRETS_FILE does not exist: {}",
                self.client_secrets_file.display()
            );
        }

        if self.provider == ProviderKind::Proxy && self.auth_proxy_domain.is_none() {
            anyhow::bail!("WB_AUTH_PROXY_DOMAIN is required when WB_AUTH_PROVIDER=proxy");
        }

        if let Some(ref url) = self.key_service_url {
            reqwest::Url::parse(url)
                .with_context(|| format!("WB_KEY_SERVICE_URL is not a valid URL: {}", url))?;
        }

        Ok(())
    }
}

/// `~/.workbench`
fn default_context_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".workbench"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse the provider variant
pub fn parse_provider(s: &str) -> Result<ProviderKind> {
    match s.trim().to_lowercase().as_str() {
        "native" | "google" => Ok(ProviderKind::Native),
        "proxy" | "auth0" => Ok(ProviderKind::Proxy),
        other => anyhow::bail!("Unknown auth provider '{}' (expected native or proxy)", other),
    }
}

/// Parse the browser launch option; anything but `manual` launches a browser
pub fn parse_browser(s: &str) -> LoginMode {
    match s.trim().to_lowercase().as_str() {
        "manual" => LoginMode::Manual,
        _ => LoginMode::Browser,
    }
}

/// Parse an explicit `login --mode`
pub fn parse_login_mode(s: &str) -> Result<LoginMode> {
    match s.trim().to_lowercase().as_str() {
        "browser" | "auto" => Ok(LoginMode::Browser),
        "manual" => Ok(LoginMode::Manual),
        "adc" | "app-default-credentials" | "app_default_credentials" => {
            Ok(LoginMode::AppDefaultCredentials)
        }
        other => anyhow::bail!("Unknown login mode '{}' (expected browser, manual or adc)", other),
    }
}

/// Numeric setting read only from the environment
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(parse_provider("native").unwrap(), ProviderKind::Native);
        assert_eq!(parse_provider("PROXY").unwrap(), ProviderKind::Proxy);
        assert_eq!(parse_provider(" auth0 ").unwrap(), ProviderKind::Proxy);
        assert!(parse_provider("saml").is_err());
    }

    #[test]
    fn test_parse_browser() {
        assert_eq!(parse_browser("manual"), LoginMode::Manual);
        assert_eq!(parse_browser("MANUAL"), LoginMode::Manual);
        assert_eq!(parse_browser("auto"), LoginMode::Browser);
        assert_eq!(parse_browser("anything"), LoginMode::Browser);
    }

    #[test]
    fn test_parse_login_mode() {
        assert_eq!(parse_login_mode("adc").unwrap(), LoginMode::AppDefaultCredentials);
        assert_eq!(
            parse_login_mode("App-Default-Credentials").unwrap(),
            LoginMode::AppDefaultCredentials
        );
        assert_eq!(parse_login_mode("manual").unwrap(), LoginMode::Manual);
        assert_eq!(parse_login_mode("auto").unwrap(), LoginMode::Browser);
        assert!(parse_login_mode("kiosk").is_err());
    }

    #[test]
    fn test_env_or() {
        std::env::set_var("WB_TEST_ENV_OR_VALUE", "42");
        std::env::set_var("WB_TEST_ENV_OR_BAD", "not-a-number");
        assert_eq!(env_or("WB_TEST_ENV_OR_VALUE", 7u64), 42);
        assert_eq!(env_or("WB_TEST_ENV_OR_BAD", 7u64), 7);
        assert_eq!(env_or("WB_TEST_ENV_OR_MISSING", 7u32), 7);
    }

    #[test]
    fn test_cli_flags_build_config() {
        let args = parse(&[
            "workbench-auth",
            "--context-dir",
            "/tmp/wb",
            "--provider",
            "proxy",
            "--client-secrets",
            "/tmp/secrets.json",
            "--auth-proxy-domain",
            "tenant.auth.example.com",
            "--browser",
            "manual",
            "--login-timeout",
            "0",
            "status",
            "--json",
        ]);

        let config = Config::from_args(&args.global).unwrap();
        assert_eq!(config.context_dir, PathBuf::from("/tmp/wb"));
        assert_eq!(config.provider, ProviderKind::Proxy);
        assert_eq!(config.client_secrets_file, PathBuf::from("/tmp/secrets.json"));
        assert_eq!(config.auth_proxy_domain.as_deref(), Some("tenant.auth.example.com"));
        assert_eq!(config.login_mode, LoginMode::Manual);
        assert_eq!(config.login_timeout, 0);
        assert!(matches!(args.command, Command::Status { json: true }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&[
            "workbench-auth",
            "workspace",
            "set",
            "ws-1",
            "--project",
            "proj-1",
            "--client-secrets",
            "/tmp/secrets.json",
        ]);
        assert_eq!(args.global.client_secrets.as_deref(), Some("/tmp/secrets.json"));
        match args.command {
            Command::Workspace(WorkspaceCommand::Set { id, project }) => {
                assert_eq!(id, "ws-1");
                assert_eq!(project.as_deref(), Some("proj-1"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_validate() {
        let secrets = tempfile::NamedTempFile::new().unwrap();
        let mut config = Config {
            context_dir: PathBuf::from("/tmp/wb"),
            provider: ProviderKind::Native,
            client_secrets_file: secrets.path().to_path_buf(),
            auth_proxy_domain: None,
            key_service_url: Some("https://sam.example.test".to_string()),
            login_mode: LoginMode::Browser,
            login_timeout: 300,
            login_landing_page: None,
            token_refresh_skew: 60,
            adc_file: None,
            http_connect_timeout: 30,
            http_request_timeout: 60,
            http_max_retries: 3,
        };
        assert!(config.validate().is_ok());

        config.provider = ProviderKind::Proxy;
        assert!(config.validate().is_err());

        config.auth_proxy_domain = Some("tenant.auth.example.com".to_string());
        assert!(config.validate().is_ok());

        config.key_service_url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        config.key_service_url = None;
        config.client_secrets_file = PathBuf::from("/nonexistent/secrets.json");
        assert!(config.validate().is_err());
    }
}

// === Interactive Setup ===

/// Interactive setup is needed when there is no .env file and no client secrets configured
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    let has_client_secrets = std::env::var("WB_CLIENT_SECRETS_FILE").is_ok();

    !env_file_exists && !has_client_secrets
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    eprintln!();
    eprintln!("Workbench credentials: first time setup");
    eprintln!();
    eprintln!("No configuration found. Let's set up login.");
    eprintln!();

    let providers = vec!["native", "proxy"];
    let provider_idx = Select::new()
        .with_prompt("Select OAuth provider integration")
        .items(&providers)
        .default(0)
        .interact()
        .context("Failed to read provider selection")?;
    let provider = providers[provider_idx].to_string();

    let client_secrets_file: String = Input::new()
        .with_prompt("Path to OAuth client secrets JSON (WB_CLIENT_SECRETS_FILE)")
        .interact_text()
        .context("Failed to read WB_CLIENT_SECRETS_FILE")?;

    let expanded_path = expand_tilde(&client_secrets_file);
    if !expanded_path.exists() {
        anyhow::bail!(
            "Client secrets file does not exist: {}",
            expanded_path.display()
        );
    }

    let auth_proxy_domain = if provider == "proxy" {
        let domain: String = Input::new()
            .with_prompt("Auth proxy domain (WB_AUTH_PROXY_DOMAIN)")
            .interact_text()
            .context("Failed to read WB_AUTH_PROXY_DOMAIN")?;
        Some(domain)
    } else {
        None
    };

    let key_service_url: String = Input::new()
        .with_prompt("Key service URL (WB_KEY_SERVICE_URL, empty to skip)")
        .allow_empty(true)
        .interact_text()
        .context("Failed to read WB_KEY_SERVICE_URL")?;

    let browsers = vec!["auto", "manual"];
    let browser_idx = Select::new()
        .with_prompt("Browser launch option")
        .items(&browsers)
        .default(0)
        .interact()
        .context("Failed to read browser selection")?;

    let config = InteractiveConfig {
        provider,
        client_secrets_file,
        auth_proxy_domain,
        key_service_url: Some(key_service_url).filter(|s| !s.is_empty()),
        browser: browsers[browser_idx].to_string(),
    };

    eprintln!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        eprintln!("Configuration saved to .env file");
    }
    eprintln!();

    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub provider: String,
    pub client_secrets_file: String,
    pub auth_proxy_domain: Option<String>,
    pub key_service_url: Option<String>,
    pub browser: String,
}

impl InteractiveConfig {
    /// Export as environment variables so argument parsing picks them up
    pub fn apply_to_env(&self) {
        std::env::set_var("WB_AUTH_PROVIDER", &self.provider);
        std::env::set_var("WB_CLIENT_SECRETS_FILE", &self.client_secrets_file);
        std::env::set_var("WB_BROWSER", &self.browser);
        if let Some(ref domain) = self.auth_proxy_domain {
            std::env::set_var("WB_AUTH_PROXY_DOMAIN", domain);
        }
        if let Some(ref url) = self.key_service_url {
            std::env::set_var("WB_KEY_SERVICE_URL", url);
        }
    }
}

fn render_env_file(config: &InteractiveConfig) -> String {
    let mut env_content = format!(
        r#"# Workbench credential configuration
# Generated by interactive setup

# OAuth provider integration (native, proxy)
WB_AUTH_PROVIDER={}

# OAuth client secrets JSON (required)
WB_CLIENT_SECRETS_FILE={}

# Browser launch option (auto, manual)
WB_BROWSER={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=warn
"#,
        config.provider, config.client_secrets_file, config.browser,
    );

    if let Some(ref domain) = config.auth_proxy_domain {
        env_content.push_str(&format!("\n# Auth proxy domain\nWB_AUTH_PROXY_DOMAIN={}\n", domain));
    }
    if let Some(ref url) = config.key_service_url {
        env_content.push_str(&format!("\n# Key-issuing service\nWB_KEY_SERVICE_URL={}\n", url));
    }
    env_content
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(render_env_file(config).as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
