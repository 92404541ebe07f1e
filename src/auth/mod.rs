// Credential storage and session management

pub mod keyring;
pub mod session;
pub mod store;

pub use self::keyring::KeyringBackend;
pub use session::{Session, token_expiry};
pub use store::{
    AuthState, AuthStore, CredentialBackend, Credentials, FileBackend, MemoryBackend,
    PersistedCredentials,
};
