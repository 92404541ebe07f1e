/// System keyring backend for stored credentials
/// Uses native keyring: Secret Service (Linux), Keychain (macOS), Credential Manager (Windows)
use keyring::Entry;

use super::store::{CredentialBackend, PersistedCredentials};
use crate::error::StoreError;

const ENTRY_USER: &str = "session";

pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, ENTRY_USER)?)
    }
}

impl CredentialBackend for KeyringBackend {
    fn name(&self) -> &str {
        "keyring"
    }

    fn load(&self) -> Result<Option<PersistedCredentials>, StoreError> {
        match self.entry()?.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credentials: &PersistedCredentials) -> Result<(), StoreError> {
        let json = serde_json::to_string(credentials)?;
        self.entry()?.set_password(&json)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires system keyring
    fn test_keyring_roundtrip() {
        let backend = KeyringBackend::new("frontdesk-test");
        let credentials = PersistedCredentials {
            access: Some("test-access".to_string()),
            refresh: Some("test-refresh".to_string()),
            updated_at: Some(chrono::Utc::now()),
        };

        backend.save(&credentials).unwrap();

        let loaded = backend.load().unwrap().unwrap();
        assert_eq!(loaded.access, credentials.access);
        assert_eq!(loaded.refresh, credentials.refresh);

        backend.remove().unwrap();
        assert!(backend.load().unwrap().is_none());
    }
}
