//! Session state: the credential, where it is persisted, how it is refreshed,
//! and who hears about it when it can no longer be refreshed.

pub mod credential;
pub mod observer;
pub mod refresh;
pub mod storage;

pub use credential::{Credential, TokenGrant};
pub use observer::{ExpiryReason, SessionExpired, SessionObserver};
pub use refresh::{OAuthRefreshGrant, RefreshCoordinator, RefreshProtocol};
#[cfg(feature = "system-keyring")]
pub use storage::KeyringSecureStorage;
pub use storage::{
    CachedCredentialStore, CredentialStore, FileSecureStorage, MemorySecureStorage, SecureStorage,
};
