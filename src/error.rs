// Error handling module
// Defines the error taxonomy surfaced by credential operations

use thiserror::Error;

/// Errors that can occur while acquiring, refreshing or revoking credentials
#[derive(Error, Debug)]
pub enum AuthError {
    /// The user can fix this by taking an action (logging in, retrying)
    #[error("{0}")]
    UserActionable(String),

    /// Key-issuing service rejected the pet key request
    #[error("Error fetching pet service account key (status code = {status}): {message}")]
    KeyService { status: u16, message: String },

    /// Non-success response from any other remote endpoint
    #[error("Remote service error: {status} - {message}")]
    Remote { status: u16, message: String },

    /// I/O, network or serialization failure
    #[error("System error: {0:#}")]
    System(#[from] anyhow::Error),
}

impl AuthError {
    pub fn login_required() -> Self {
        AuthError::UserActionable("The current user is not defined. Login required.".to_string())
    }

    /// Whether a remediation message is enough for the user to recover
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            AuthError::UserActionable(_) | AuthError::KeyService { .. }
        )
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        if self.is_user_actionable() {
            1
        } else {
            2
        }
    }
}

/// Result type alias for credential operations
pub type Result<T> = std::result::Result<T, AuthError>;
