//! Shared authentication state.
//!
//! [`AuthStore`] keeps the current credential pair in memory and mirrors every
//! change to a [`CredentialBackend`] so a session survives restarts. Readers
//! only ever see the in-memory copy; it is updated before the backend is
//! written so a slow or failing backend never hides a fresh token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

use super::keyring::KeyringBackend;

/// Access/refresh pair as seen by the request pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

/// Snapshot of the store
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub credentials: Credentials,
    pub authenticated: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// On-disk / keyring representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCredentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Durable storage for the credential pair
pub trait CredentialBackend: Send + Sync {
    fn name(&self) -> &str;
    fn load(&self) -> Result<Option<PersistedCredentials>, StoreError>;
    fn save(&self, credentials: &PersistedCredentials) -> Result<(), StoreError>;
    fn remove(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct AuthStore {
    state: Arc<RwLock<AuthState>>,
    backend: Arc<dyn CredentialBackend>,
}

impl AuthStore {
    /// Load persisted credentials from `backend`.
    ///
    /// The session counts as authenticated when an access token was found.
    pub fn load(backend: Arc<dyn CredentialBackend>) -> Result<Self, StoreError> {
        let state = match backend.load()? {
            Some(persisted) => AuthState {
                authenticated: persisted.access.is_some(),
                credentials: Credentials {
                    access: persisted.access,
                    refresh: persisted.refresh,
                },
                updated_at: persisted.updated_at,
            },
            None => AuthState::default(),
        };

        tracing::debug!(
            backend = backend.name(),
            authenticated = state.authenticated,
            "Credential store loaded"
        );

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            backend,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend: Arc<dyn CredentialBackend> = match config.backend {
            StoreBackend::File => Arc::new(FileBackend::new(config.credentials_path())),
            StoreBackend::Keyring => Arc::new(KeyringBackend::new(&config.keyring_service)),
            StoreBackend::Memory => Arc::new(MemoryBackend::default()),
        };
        Self::load(backend)
    }

    /// In-memory store with nothing persisted
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(AuthState::default())),
            backend: Arc::new(MemoryBackend::default()),
        }
    }

    pub fn current(&self) -> Credentials {
        self.read().credentials.clone()
    }

    pub fn state(&self) -> AuthState {
        self.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().authenticated
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().credentials.access.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().credentials.refresh.clone()
    }

    /// Replace the credential pair and mark the session authenticated
    pub fn set(&self, access: String, refresh: String) -> Result<(), StoreError> {
        let now = Utc::now();
        let persisted = PersistedCredentials {
            access: Some(access.clone()),
            refresh: Some(refresh.clone()),
            updated_at: Some(now),
        };

        {
            let mut state = self.write();
            state.credentials = Credentials {
                access: Some(access),
                refresh: Some(refresh),
            };
            state.authenticated = true;
            state.updated_at = Some(now);
        }

        self.backend.save(&persisted)
    }

    /// Drop both tokens and mark the session logged out
    pub fn clear(&self) -> Result<(), StoreError> {
        {
            let mut state = self.write();
            state.credentials = Credentials::default();
            state.authenticated = false;
            state.updated_at = Some(Utc::now());
        }

        self.backend.remove()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AuthState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AuthState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// JSON file backend, the CLI default
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self) -> Result<Option<PersistedCredentials>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credentials: &PersistedCredentials) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(credentials)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;

        // Tokens are secrets: owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local backend, nothing survives a restart
#[derive(Default)]
pub struct MemoryBackend {
    slot: Mutex<Option<PersistedCredentials>>,
}

impl MemoryBackend {
    pub fn with_credentials(access: &str, refresh: &str) -> Self {
        Self {
            slot: Mutex::new(Some(PersistedCredentials {
                access: Some(access.to_string()),
                refresh: Some(refresh.to_string()),
                updated_at: None,
            })),
        }
    }
}

impl CredentialBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self) -> Result<Option<PersistedCredentials>, StoreError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, credentials: &PersistedCredentials) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_credentials_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("frontdesk-test-{}", uuid::Uuid::new_v4()))
            .join("credentials.json")
    }

    #[test]
    fn test_empty_store_is_logged_out() {
        let store = AuthStore::in_memory();
        assert!(!store.is_authenticated());
        assert_eq!(store.current(), Credentials::default());
    }

    #[test]
    fn test_set_and_clear() {
        let store = AuthStore::in_memory();

        store.set("A1".to_string(), "R1".to_string()).unwrap();
        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("A1"));
        assert_eq!(store.refresh_token().as_deref(), Some("R1"));
        assert!(store.state().updated_at.is_some());

        store.clear().unwrap();
        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let store = AuthStore::in_memory();
        let other = store.clone();

        store.set("A1".to_string(), "R1".to_string()).unwrap();
        assert_eq!(other.access_token().as_deref(), Some("A1"));
    }

    #[test]
    fn test_load_derives_authenticated_from_access_token() {
        let backend = Arc::new(MemoryBackend::with_credentials("A1", "R1"));
        let store = AuthStore::load(backend).unwrap();
        assert!(store.is_authenticated());

        let backend = Arc::new(MemoryBackend::default());
        backend
            .save(&PersistedCredentials {
                access: None,
                refresh: Some("R1".to_string()),
                updated_at: None,
            })
            .unwrap();
        let store = AuthStore::load(backend).unwrap();
        assert!(!store.is_authenticated());
        assert_eq!(store.refresh_token().as_deref(), Some("R1"));
    }

    #[test]
    fn test_file_backend_survives_reload() {
        let path = temp_credentials_path();

        let store = AuthStore::load(Arc::new(FileBackend::new(&path))).unwrap();
        assert!(!store.is_authenticated());
        store.set("A2".to_string(), "R2".to_string()).unwrap();

        let reloaded = AuthStore::load(Arc::new(FileBackend::new(&path))).unwrap();
        assert!(reloaded.is_authenticated());
        assert_eq!(
            reloaded.current(),
            Credentials {
                access: Some("A2".to_string()),
                refresh: Some("R2".to_string()),
            }
        );

        reloaded.clear().unwrap();
        assert!(!path.exists());

        let after_clear = AuthStore::load(Arc::new(FileBackend::new(&path))).unwrap();
        assert!(!after_clear.is_authenticated());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_backend_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_credentials_path();
        let backend = FileBackend::new(&path);
        backend
            .save(&PersistedCredentials {
                access: Some("A1".to_string()),
                refresh: Some("R1".to_string()),
                updated_at: None,
            })
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_clear_missing_file_is_ok() {
        let backend = FileBackend::new(temp_credentials_path());
        assert!(backend.remove().is_ok());
        assert!(backend.load().unwrap().is_none());
    }
}
