// Credential persistence in a SQLite key/value database

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Namespace holding the user credential record
pub const CREDENTIALS_NAMESPACE: &str = "credentials";

/// Namespace holding the ID token record
pub const ID_TOKENS_NAMESPACE: &str = "id_tokens";

/// Only one active user is persisted at a time, so the keys are fixed
pub const CREDENTIAL_STORE_KEY: &str = "CURRENT_USER";
pub const ID_TOKEN_STORE_KEY: &str = "CURRENT_ID_TOKEN";

/// File name of the database inside the store directory
pub const STORE_FILENAME: &str = "credentials.db";

/// How long a writer waits for another CLI invocation holding the database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable key/value persistence for opaque credential records
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Insert or fully replace a record
    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// Read a record, `None` if absent
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Delete a record. Returns whether it existed; a missing key is not an error.
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;
}

impl dyn CredentialStore {
    /// Serialize and store a typed record
    pub fn put_record<T: Serialize>(&self, namespace: &str, key: &str, record: &T) -> Result<()> {
        let json = serde_json::to_string(record)
            .with_context(|| format!("Failed to serialize record {}/{}", namespace, key))?;
        self.put(namespace, key, &json)
    }

    /// Load and deserialize a typed record
    pub fn get_record<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key)? {
            Some(json) => {
                let record = serde_json::from_str(&json)
                    .with_context(|| format!("Failed to parse stored record {}/{}", namespace, key))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

/// SQLite-backed store. Every call opens, uses and closes its own connection so
/// concurrent CLI invocations never hold long-lived locks.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    path: PathBuf,
}

impl SqliteCredentialStore {
    /// Create a store in `dir`, creating the directory and schema if needed
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create credential store directory: {}", dir.display()))?;

        let store = Self {
            path: dir.join(STORE_FILENAME),
        };

        let conn = store.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credential_kv (
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
        )
        .context("Failed to initialize credential store schema")?;
        drop(conn);

        restrict_permissions(&store.path);
        Ok(store)
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        let conn = rusqlite::Connection::open(&self.path)
            .with_context(|| format!("Failed to open credential store: {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to configure credential store busy timeout")?;
        Ok(conn)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO credential_kv (namespace, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (namespace, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![namespace, key, value, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to write {}/{} to credential store", namespace, key))?;

        tracing::debug!(namespace, key, "Stored credential record");
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT value FROM credential_kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read {}/{} from credential store", namespace, key))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let conn = self.connect()?;
        let removed = conn
            .execute(
                "DELETE FROM credential_kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .with_context(|| format!("Failed to delete {}/{} from credential store", namespace, key))?;

        if removed == 0 {
            tracing::debug!(namespace, key, "Credential record not found, nothing to delete");
        }
        Ok(removed > 0)
    }
}

/// Owner-only permissions for files holding secrets
pub(crate) fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::UserCredential;
    use std::sync::Arc;

    fn temp_store() -> (tempfile::TempDir, SqliteCredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCredentialStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_replace() {
        let (_dir, store) = temp_store();

        assert_eq!(store.get(CREDENTIALS_NAMESPACE, "k").unwrap(), None);

        store.put(CREDENTIALS_NAMESPACE, "k", "first").unwrap();
        assert_eq!(
            store.get(CREDENTIALS_NAMESPACE, "k").unwrap().as_deref(),
            Some("first")
        );

        store.put(CREDENTIALS_NAMESPACE, "k", "second").unwrap();
        assert_eq!(
            store.get(CREDENTIALS_NAMESPACE, "k").unwrap().as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let (_dir, store) = temp_store();

        store.put(CREDENTIALS_NAMESPACE, "k", "cred").unwrap();
        store.put(ID_TOKENS_NAMESPACE, "k", "id").unwrap();

        assert_eq!(
            store.get(CREDENTIALS_NAMESPACE, "k").unwrap().as_deref(),
            Some("cred")
        );
        assert_eq!(
            store.get(ID_TOKENS_NAMESPACE, "k").unwrap().as_deref(),
            Some("id")
        );

        assert!(store.delete(ID_TOKENS_NAMESPACE, "k").unwrap());
        assert!(store.get(CREDENTIALS_NAMESPACE, "k").unwrap().is_some());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = temp_store();

        store.put(CREDENTIALS_NAMESPACE, "k", "v").unwrap();
        assert!(store.delete(CREDENTIALS_NAMESPACE, "k").unwrap());
        assert!(!store.delete(CREDENTIALS_NAMESPACE, "k").unwrap());
        assert!(!store.delete(CREDENTIALS_NAMESPACE, "never-written").unwrap());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteCredentialStore::open(dir.path()).unwrap();
            store.put(CREDENTIALS_NAMESPACE, "k", "persisted").unwrap();
        }

        let reopened = SqliteCredentialStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get(CREDENTIALS_NAMESPACE, "k").unwrap().as_deref(),
            Some("persisted")
        );
    }

    #[test]
    fn test_typed_records() {
        let (_dir, store) = temp_store();
        let store: Arc<dyn CredentialStore> = Arc::new(store);

        let cred = UserCredential {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            access_token: "A".to_string(),
            expiry_time: Utc::now(),
            refresh_token: Some("R".to_string()),
        };

        store
            .put_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY, &cred)
            .unwrap();
        let loaded: Option<UserCredential> = store
            .get_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY)
            .unwrap();
        assert_eq!(loaded, Some(cred));
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let (_dir, store) = temp_store();
        store
            .put(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY, "not json")
            .unwrap();

        let store: Arc<dyn CredentialStore> = Arc::new(store);
        let result: Result<Option<UserCredential>> =
            store.get_record(CREDENTIALS_NAMESPACE, CREDENTIAL_STORE_KEY);
        assert!(result.is_err());
    }

    #[test]
    fn test_two_handles_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let first = SqliteCredentialStore::open(dir.path()).unwrap();
        let second = SqliteCredentialStore::open(dir.path()).unwrap();

        first.put(CREDENTIALS_NAMESPACE, "k", "from-first").unwrap();
        second.put(CREDENTIALS_NAMESPACE, "k", "from-second").unwrap();

        // Last writer wins
        assert_eq!(
            first.get(CREDENTIALS_NAMESPACE, "k").unwrap().as_deref(),
            Some("from-second")
        );
    }
}
