// Authentication module
// Credential acquisition, persistence, refresh and revocation

pub mod adc;
pub mod credentials;
pub mod flow;
pub mod manager;
pub mod native;
pub mod pet;
pub mod provider;
pub mod proxy;
pub mod receiver;
pub mod refresh;
pub mod types;

pub use adc::AppDefaultCredentials;
pub use credentials::{CredentialStore, SqliteCredentialStore};
pub use flow::{AuthorizationFlow, FlowContext};
pub use manager::{AuthState, AuthStatus, CredentialManager, ManagerOptions};
pub use pet::PetCredentialFetcher;
pub use provider::ProviderSettings;
pub use receiver::{CodeReceiver, LocalServerReceiver, ManualReceiver};
pub use refresh::TokenRefresher;
pub use types::{IdToken, LoginMode, PetCredential, ProviderKind, UserCredential};
