use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use super::UserRole;

/// File-persisted access/refresh token pair for the current session.
///
/// The browser console kept these in localStorage; here they live as a JSON
/// file under the data dir so a restarted process resumes its session. The
/// store is the single owner of credentials: the API client reads the access
/// token per request and writes back the rotated one after a refresh, the
/// socket manager reads it when (re)connecting.
///
/// Cheap to clone (uses Arc internally) and safe to share across tasks.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<RwLock<SessionState>>,
    path: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct SessionState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    role: Option<UserRole>,
}

impl TokenStore {
    /// Open the store, loading any persisted session.
    ///
    /// A missing file means no session; an unreadable one is treated the same
    /// way (the user logs in again), with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("ignoring unreadable session file {path:?}: {e}");
                SessionState::default()
            }),
            Err(_) => SessionState::default(),
        };

        Self {
            inner: Arc::new(RwLock::new(state)),
            path,
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.read().expect("token store lock").access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.read().expect("token store lock").refresh_token.clone()
    }

    pub fn role(&self) -> Option<UserRole> {
        self.inner.read().expect("token store lock").role
    }

    pub fn has_session(&self) -> bool {
        self.access_token().is_some()
    }

    /// Store a full session after login
    pub fn set_session(
        &self,
        access_token: String,
        refresh_token: String,
        role: UserRole,
    ) -> Result<()> {
        {
            let mut state = self.inner.write().expect("token store lock");
            state.access_token = Some(access_token);
            state.refresh_token = Some(refresh_token);
            state.role = Some(role);
        }
        self.persist()
    }

    /// Replace only the access token after a refresh rotation
    pub fn set_access_token(&self, access_token: String) -> Result<()> {
        self.inner.write().expect("token store lock").access_token = Some(access_token);
        self.persist()
    }

    /// Drop the session and remove the persisted file
    pub fn clear(&self) {
        *self.inner.write().expect("token store lock") = SessionState::default();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove session file {:?}: {e}", self.path);
        }
    }

    fn persist(&self) -> Result<()> {
        let raw = {
            let state = self.inner.read().expect("token store lock");
            serde_json::to_string_pretty(&*state).context("failed to serialize session")?
        };
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write session file {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_has_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("session.json"));
        assert!(!store.has_session());
        assert_eq!(store.access_token(), None);
    }

    #[test]
    fn session_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = TokenStore::open(&path);
        store
            .set_session("access".into(), "refresh".into(), UserRole::Operator)
            .unwrap();

        let reopened = TokenStore::open(&path);
        assert_eq!(reopened.access_token().as_deref(), Some("access"));
        assert_eq!(reopened.refresh_token().as_deref(), Some("refresh"));
        assert_eq!(reopened.role(), Some(UserRole::Operator));
    }

    #[test]
    fn refresh_rotates_only_the_access_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("session.json"));
        store
            .set_session("old".into(), "refresh".into(), UserRole::Admin)
            .unwrap();

        store.set_access_token("new".into()).unwrap();

        assert_eq!(store.access_token().as_deref(), Some("new"));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh"));
    }

    #[test]
    fn clear_removes_the_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = TokenStore::open(&path);
        store
            .set_session("access".into(), "refresh".into(), UserRole::Admin)
            .unwrap();
        assert!(path.exists());

        store.clear();
        assert!(!store.has_session());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_session_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let store = TokenStore::open(&path);
        assert!(!store.has_session());
    }
}
