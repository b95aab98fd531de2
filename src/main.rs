use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;

use workbench_auth::auth::{AuthStatus, CredentialManager};
use workbench_auth::config::{self, parse_login_mode, CliArgs, Command, Config, WorkspaceCommand};
use workbench_auth::context::WorkspaceScope;
use workbench_auth::error::{AuthError, Result};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let mut args = CliArgs::parse();

    // First run: no .env and no client secrets anywhere
    if args.global.client_secrets.is_none()
        && config::needs_interactive_setup()
        && std::io::stdin().is_terminal()
    {
        match config::run_interactive_setup() {
            Ok(interactive_config) => {
                interactive_config.apply_to_env();
                args = CliArgs::parse();
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                return ExitCode::from(1);
            }
        }
    }

    // Logging goes to stderr so stdout stays clean for command output
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.global.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let config = Config::from_args(&args.global)
        .and_then(|config| config.validate().map(|_| config))
        .map_err(|e| AuthError::UserActionable(format!("{:#}", e)))?;

    let manager = CredentialManager::from_config(&config)?;

    match args.command {
        Command::Login { mode } => {
            match mode.as_deref() {
                Some(mode) => {
                    let mode =
                        parse_login_mode(mode).map_err(|e| AuthError::UserActionable(e.to_string()))?;
                    manager.login(mode).await?;
                }
                None => manager.login_default().await?,
            }

            let status = manager.status().await?;
            match status.email {
                Some(email) => println!("Logged in as {}.", email),
                None => println!("Logged in."),
            }
        }

        Command::Logout => {
            manager.logout().await;
            println!("Logged out.");
        }

        Command::Status { json } => {
            let status = manager.status().await?;
            if json {
                let rendered = serde_json::to_string_pretty(&status)
                    .map_err(|e| AuthError::System(e.into()))?;
                println!("{}", rendered);
            } else {
                print_status(&status);
            }
        }

        Command::AccessToken => {
            println!("{}", manager.get_access_token().await?);
        }

        Command::IdToken => {
            println!("{}", manager.get_id_token().await?);
        }

        Command::PetKey { scope } => {
            let pet = manager.fetch_pet_credential(scope.as_deref()).await?;
            println!("{}", pet.email());
        }

        Command::Workspace(WorkspaceCommand::Set { id, project }) => {
            manager
                .set_workspace(WorkspaceScope {
                    id: id.clone(),
                    project_id: project,
                })
                .await?;
            println!("Active workspace: {}", id);
        }

        Command::Workspace(WorkspaceCommand::Clear) => {
            manager.clear_workspace().await?;
            println!("Active workspace cleared.");
        }
    }

    Ok(())
}

fn print_status(status: &AuthStatus) {
    if !status.logged_in {
        println!("Not logged in.");
    } else {
        match &status.email {
            Some(email) => println!("Logged in as {}.", email),
            None => println!("Logged in."),
        }
    }

    if let Some(ref identity) = status.identity {
        println!("  user key:             {}", identity.key);
    }
    if let Some(mode) = status.login_mode {
        println!("  login mode:           {:?}", mode);
    }
    if let Some(expiry) = status.access_token_expiry {
        println!("  access token expires: {}", expiry.to_rfc3339());
    }
    if let Some(expiry) = status.id_token_expiry {
        println!("  ID token expires:     {}", expiry.to_rfc3339());
    }
    match &status.workspace {
        Some(workspace) => println!("  workspace:            {}", workspace.id),
        None => println!("  workspace:            (none)"),
    }
}
