//! Session blob and credential storage.
//!
//! The broker only needs a key-value view keyed by user id. The trait is
//! the seam to whatever actually persists sessions; the in-memory store
//! backs the daemon by default and every test.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// A captured session, attributed to the account it belongs to.
/// `payload` is relayed verbatim and never parsed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionBlob {
    pub user_id: String,
    pub username: String,
    pub payload: Vec<u8>,
}

impl fmt::Debug for SessionBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBlob")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, user_id: &str) -> Result<Option<SessionBlob>, StoreError>;

    async fn put_session(&self, blob: SessionBlob) -> Result<(), StoreError>;

    /// Drop the cached session, returning it if there was one.
    async fn invalidate_session(&self, user_id: &str) -> Result<Option<SessionBlob>, StoreError>;

    /// Suppress auto-relay for the account until the next stored login.
    async fn mark_logged_out(&self, user_id: &str) -> Result<(), StoreError>;

    async fn clear_logged_out(&self, user_id: &str) -> Result<(), StoreError>;

    async fn is_logged_out(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn credentials(&self, user_id: &str) -> Result<Option<Credentials>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, SessionBlob>,
    logged_out: HashSet<String>,
    credentials: HashMap<String, Credentials>,
}

/// Process-local store. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    tables: RwLock<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn put_credentials(&self, user_id: &str, credentials: Credentials) {
        self.tables
            .write()
            .await
            .credentials
            .insert(user_id.to_owned(), credentials);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, user_id: &str) -> Result<Option<SessionBlob>, StoreError> {
        Ok(self.tables.read().await.sessions.get(user_id).cloned())
    }

    async fn put_session(&self, blob: SessionBlob) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .sessions
            .insert(blob.user_id.clone(), blob);
        Ok(())
    }

    async fn invalidate_session(&self, user_id: &str) -> Result<Option<SessionBlob>, StoreError> {
        Ok(self.tables.write().await.sessions.remove(user_id))
    }

    async fn mark_logged_out(&self, user_id: &str) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .logged_out
            .insert(user_id.to_owned());
        Ok(())
    }

    async fn clear_logged_out(&self, user_id: &str) -> Result<(), StoreError> {
        self.tables.write().await.logged_out.remove(user_id);
        Ok(())
    }

    async fn is_logged_out(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.read().await.logged_out.contains(user_id))
    }

    async fn credentials(&self, user_id: &str) -> Result<Option<Credentials>, StoreError> {
        Ok(self.tables.read().await.credentials.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(user: &str, token: &[u8]) -> SessionBlob {
        SessionBlob {
            user_id: user.into(),
            username: format!("{user}-name"),
            payload: token.to_vec(),
        }
    }

    #[tokio::test]
    async fn put_get_invalidate() {
        let store = MemorySessionStore::new();
        assert!(store.get_session("u1").await.unwrap().is_none());

        store.put_session(blob("u1", b"tok-1")).await.unwrap();
        store.put_session(blob("u1", b"tok-2")).await.unwrap();
        let got = store.get_session("u1").await.unwrap().unwrap();
        assert_eq!(got.payload, b"tok-2");

        let dropped = store.invalidate_session("u1").await.unwrap();
        assert_eq!(dropped.map(|b| b.payload), Some(b"tok-2".to_vec()));
        assert!(store.get_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logged_out_mark_round_trip() {
        let store = MemorySessionStore::new();
        assert!(!store.is_logged_out("u1").await.unwrap());
        store.mark_logged_out("u1").await.unwrap();
        assert!(store.is_logged_out("u1").await.unwrap());
        store.clear_logged_out("u1").await.unwrap();
        assert!(!store.is_logged_out("u1").await.unwrap());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let c = Credentials {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let b = blob("u1", b"secret-token");
        assert!(!format!("{c:?}").contains("hunter2"));
        assert!(!format!("{b:?}").contains("secret"));
    }
}
