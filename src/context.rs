// Session state persisted between CLI invocations

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::auth::credentials::restrict_permissions;
use crate::auth::types::LoginMode;

/// Session file name inside the context directory
pub const SESSION_FILENAME: &str = "context.json";

/// Directory holding cached pet keys, one subdirectory per user
pub const PET_KEYS_DIRNAME: &str = "pet-keys";

/// The CLI's local notion of the current user. Generated on first login and
/// used to namespace local state; unrelated to the provider's subject id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub key: String,
    pub created_at: DateTime<Utc>,
}

impl UserIdentity {
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            created_at: now,
        }
    }
}

/// Active workspace; its id scopes pet credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceScope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl WorkspaceScope {
    /// Scope sent to the key-issuing service: the backing project when known
    pub fn pet_scope(&self) -> &str {
        self.project_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SessionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<UserIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workspace: Option<WorkspaceScope>,
    /// How the current user logged in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    login_mode: Option<LoginMode>,
}

/// Current user and workspace for one context directory
#[derive(Debug, Clone)]
pub struct Session {
    dir: PathBuf,
    state: SessionState,
}

impl Session {
    /// Load the session from `dir`. A missing or unreadable file yields an empty session.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(SESSION_FILENAME);
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable session file {}: {}", path.display(), e);
                SessionState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionState::default(),
            Err(e) => {
                tracing::warn!("Failed to read session file {}: {}", path.display(), e);
                SessionState::default()
            }
        };

        Self {
            dir: dir.to_path_buf(),
            state,
        }
    }

    /// Write the session atomically
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state).context("Failed to serialize session")?;
        write_atomic(&self.dir.join(SESSION_FILENAME), json.as_bytes())
            .context("Failed to save session")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.state.user.as_ref()
    }

    pub fn set_user(&mut self, user: UserIdentity) {
        self.state.user = Some(user);
    }

    /// Forget the user and how they logged in
    pub fn clear_user(&mut self) {
        self.state.user = None;
        self.state.login_mode = None;
    }

    pub fn login_mode(&self) -> Option<LoginMode> {
        self.state.login_mode
    }

    pub fn set_login_mode(&mut self, mode: LoginMode) {
        self.state.login_mode = Some(mode);
    }

    pub fn workspace(&self) -> Option<&WorkspaceScope> {
        self.state.workspace.as_ref()
    }

    pub fn set_workspace(&mut self, workspace: WorkspaceScope) {
        self.state.workspace = Some(workspace);
    }

    pub fn clear_workspace(&mut self) {
        self.state.workspace = None;
    }

    /// Directory holding the credential database
    pub fn store_dir(&self) -> &Path {
        &self.dir
    }

    pub fn pet_key_dir(&self, user: &UserIdentity) -> PathBuf {
        pet_key_dir(&self.dir, user)
    }

    pub fn pet_key_file(&self, user: &UserIdentity, scope: &str) -> PathBuf {
        pet_key_file(&self.dir, user, scope)
    }
}

/// Cached pet keys for one user under a context directory
pub fn pet_key_dir(context_dir: &Path, user: &UserIdentity) -> PathBuf {
    context_dir.join(PET_KEYS_DIRNAME).join(&user.key)
}

/// Cache file for one user's pet key in one scope. The scope is hex encoded so
/// distinct scopes never share a file and no scope can escape the directory.
pub fn pet_key_file(context_dir: &Path, user: &UserIdentity, scope: &str) -> PathBuf {
    pet_key_dir(context_dir, user).join(format!("{}.json", hex::encode(scope)))
}

/// Write a file atomically (write tmp + rename) with owner-only permissions.
/// Temp names carry the PID and a counter so concurrent writers never share one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);

    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    restrict_permissions(&tmp_path);
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::load(dir.path());
        assert!(session.user().is_none());
        assert!(session.workspace().is_none());
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let user = UserIdentity::generate(Utc::now());

        let mut session = Session::load(dir.path());
        session.set_user(user.clone());
        session.set_workspace(WorkspaceScope {
            id: "ws-1".to_string(),
            project_id: Some("proj-1".to_string()),
        });
        session.set_login_mode(LoginMode::AppDefaultCredentials);
        session.save().unwrap();

        let reloaded = Session::load(dir.path());
        assert_eq!(reloaded.user(), Some(&user));
        assert_eq!(reloaded.workspace().map(|w| w.pet_scope()), Some("proj-1"));
        assert_eq!(reloaded.login_mode(), Some(LoginMode::AppDefaultCredentials));

        let mut cleared = reloaded;
        cleared.clear_user();
        cleared.clear_workspace();
        cleared.save().unwrap();
        let reloaded = Session::load(dir.path());
        assert!(reloaded.user().is_none());
        assert!(reloaded.login_mode().is_none());
    }

    #[test]
    fn test_corrupt_session_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_FILENAME), "{not json").unwrap();
        assert!(Session::load(dir.path()).user().is_none());
    }

    #[test]
    fn test_pet_key_paths() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::load(dir.path());
        let user = UserIdentity {
            key: "user-1".to_string(),
            created_at: Utc::now(),
        };

        assert_eq!(
            session.pet_key_file(&user, "proj-1"),
            dir.path().join("pet-keys").join("user-1").join("70726f6a2d31.json")
        );

        let escaping = session.pet_key_file(&user, "../etc/passwd");
        assert_eq!(escaping.parent(), Some(session.pet_key_dir(&user).as_path()));
    }

    #[test]
    fn test_similar_scopes_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::load(dir.path());
        let user = UserIdentity::generate(Utc::now());

        let scopes = ["team/proj", "team_proj", "team.proj", ".team_proj", "Team_Proj"];
        let files: std::collections::HashSet<_> = scopes
            .iter()
            .map(|scope| session.pet_key_file(&user, scope))
            .collect();
        assert_eq!(files.len(), scopes.len());
    }

    #[test]
    fn test_workspace_scope_falls_back_to_id() {
        let scope = WorkspaceScope {
            id: "ws-1".to_string(),
            project_id: None,
        };
        assert_eq!(scope.pet_scope(), "ws-1");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.json");
        write_atomic(&path, b"{}").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
