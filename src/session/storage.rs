//! Credential persistence.
//!
//! Two layers:
//! - [`SecureStorage`]: the persisted medium, keyed by account name.
//!   Implementations: [`FileSecureStorage`], [`MemorySecureStorage`] and
//!   [`KeyringSecureStorage`] (requires `system-keyring` feature).
//! - [`CredentialStore`]: the single current credential consumed by the
//!   pipeline. [`CachedCredentialStore`] implements it over any
//!   [`SecureStorage`] with an in-process cache, so reading on every outgoing
//!   request does not touch the medium.
//!
//! All storage operations are synchronous and thread-safe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, instrument};

use super::credential::Credential;
use crate::error::StoreError;

// =============================================================================
// CredentialStore trait
// =============================================================================

/// Holder of the process-wide current credential.
pub trait CredentialStore: Send + Sync {
    /// The current credential, if signed in.
    fn read(&self) -> Result<Option<Credential>, StoreError>;

    /// Replace the current credential.
    fn write(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Forget the current credential (sign-out).
    fn clear(&self) -> Result<(), StoreError>;

    /// Name of this store, for logs.
    fn name(&self) -> &str;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn read(&self) -> Result<Option<Credential>, StoreError> {
        (**self).read()
    }
    fn write(&self, credential: &Credential) -> Result<(), StoreError> {
        (**self).write(credential)
    }
    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for Box<T> {
    fn read(&self) -> Result<Option<Credential>, StoreError> {
        (**self).read()
    }
    fn write(&self, credential: &Credential) -> Result<(), StoreError> {
        (**self).write(credential)
    }
    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

// =============================================================================
// SecureStorage trait
// =============================================================================

/// Persisted medium for credentials.
///
/// Operations take an `account` parameter so one medium can hold several
/// sessions (e.g. per environment).
pub trait SecureStorage: Send + Sync {
    fn load(&self, account: &str) -> Result<Option<Credential>, StoreError>;

    fn save(&self, account: &str, credential: &Credential) -> Result<(), StoreError>;

    fn remove(&self, account: &str) -> Result<(), StoreError>;

    fn name(&self) -> &str;
}

impl<T: SecureStorage + ?Sized> SecureStorage for Arc<T> {
    fn load(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        (**self).load(account)
    }
    fn save(&self, account: &str, credential: &Credential) -> Result<(), StoreError> {
        (**self).save(account, credential)
    }
    fn remove(&self, account: &str) -> Result<(), StoreError> {
        (**self).remove(account)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: SecureStorage + ?Sized> SecureStorage for Box<T> {
    fn load(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        (**self).load(account)
    }
    fn save(&self, account: &str, credential: &Credential) -> Result<(), StoreError> {
        (**self).save(account, credential)
    }
    fn remove(&self, account: &str) -> Result<(), StoreError> {
        (**self).remove(account)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

// =============================================================================
// CachedCredentialStore
// =============================================================================

#[derive(Debug, Clone)]
enum Cached {
    Unloaded,
    Loaded(Option<Credential>),
}

/// [`CredentialStore`] over a [`SecureStorage`] with a write-through cache.
///
/// The first `read` loads from the medium; afterwards reads are served from
/// memory. `write` and `clear` update the medium and the cache under the same
/// lock, so a successful `write` is visible to every later `read`.
pub struct CachedCredentialStore<S> {
    storage: S,
    account: String,
    cache: RwLock<Cached>,
}

impl<S: SecureStorage> CachedCredentialStore<S> {
    /// Account name used when none is configured.
    pub const DEFAULT_ACCOUNT: &'static str = "default";

    pub fn new(storage: S) -> Self {
        Self::with_account(storage, Self::DEFAULT_ACCOUNT)
    }

    pub fn with_account(storage: S, account: impl Into<String>) -> Self {
        Self {
            storage,
            account: account.into(),
            cache: RwLock::new(Cached::Unloaded),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Drop the cached value so the next `read` goes to the medium.
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Cached::Unloaded;
    }
}

impl<S: SecureStorage> CredentialStore for CachedCredentialStore<S> {
    fn read(&self) -> Result<Option<Credential>, StoreError> {
        if let Cached::Loaded(value) = &*self.cache.read().unwrap_or_else(PoisonError::into_inner)
        {
            return Ok(value.clone());
        }

        let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another reader may have loaded while we waited.
        if let Cached::Loaded(value) = &*guard {
            return Ok(value.clone());
        }
        let loaded = self.storage.load(&self.account)?;
        debug!(
            storage = self.storage.name(),
            found = loaded.is_some(),
            "Loaded credential into cache"
        );
        *guard = Cached::Loaded(loaded.clone());
        Ok(loaded)
    }

    fn write(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.storage.save(&self.account, credential)?;
        *guard = Cached::Loaded(Some(credential.clone()));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.storage.remove(&self.account)?;
        *guard = Cached::Loaded(None);
        Ok(())
    }

    fn name(&self) -> &str {
        self.storage.name()
    }
}

// =============================================================================
// FileSecureStorage
// =============================================================================

/// File permissions for credential files (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Directory permissions (Unix only): owner read/write/execute.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// File-based storage: one JSON file per account, `{dir}/{account}.json`.
///
/// # Security
/// - Files are created with 0600 permissions on Unix
/// - The directory is created with 0700 permissions
/// - Writes go to a temp file and are renamed into place
#[derive(Debug, Clone)]
pub struct FileSecureStorage {
    dir: PathBuf,
}

impl FileSecureStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn account_path(&self, account: &str) -> PathBuf {
        self.dir.join(format!("{account}.json"))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        if self.dir.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(DIR_MODE);
            std::fs::set_permissions(&self.dir, perms)
                .map_err(|e| StoreError::io(&self.dir, format!("chmod: {e}")))?;
        }
        Ok(())
    }
}

impl SecureStorage for FileSecureStorage {
    #[instrument(skip(self))]
    fn load(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        let path = self.account_path(account);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    #[instrument(skip(self, credential))]
    fn save(&self, account: &str, credential: &Credential) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let path = self.account_path(account);
        let content = serde_json::to_string_pretty(credential)?;
        let temp_path = path.with_extension("tmp");

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(FILE_MODE)
                .open(&temp_path)
                .map_err(|e| StoreError::io(&temp_path, e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| StoreError::io(&temp_path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&temp_path, e))?;
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&temp_path, &content).map_err(|e| StoreError::io(&temp_path, e))?;
        }

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StoreError::io(&path, format!("rename: {e}")));
        }

        debug!(path = %path.display(), "Credential saved");
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, account: &str) -> Result<(), StoreError> {
        let path = self.account_path(account);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn name(&self) -> &str {
        "file"
    }
}

// =============================================================================
// KeyringSecureStorage
// =============================================================================

/// Storage in the operating system's credential store.
///
/// Credentials are serialized to JSON and stored under `(service, account)`.
#[cfg(feature = "system-keyring")]
#[derive(Debug, Clone)]
pub struct KeyringSecureStorage {
    service: String,
}

#[cfg(feature = "system-keyring")]
impl Default for KeyringSecureStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "system-keyring")]
impl KeyringSecureStorage {
    pub const SERVICE_NAME: &'static str = "authpipe";

    pub fn new() -> Self {
        Self::with_service(Self::SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, account).map_err(|e| StoreError::Keyring(e.to_string()))
    }
}

#[cfg(feature = "system-keyring")]
impl SecureStorage for KeyringSecureStorage {
    #[instrument(skip(self))]
    fn load(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        match self.entry(account)?.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    #[instrument(skip(self, credential))]
    fn save(&self, account: &str, credential: &Credential) -> Result<(), StoreError> {
        let json = serde_json::to_string(credential)?;
        self.entry(account)?
            .set_password(&json)
            .map_err(|e| StoreError::Keyring(e.to_string()))
    }

    #[instrument(skip(self))]
    fn remove(&self, account: &str) -> Result<(), StoreError> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "keyring"
    }
}

// =============================================================================
// MemorySecureStorage
// =============================================================================

/// In-memory storage for tests and ephemeral sessions.
///
/// Clones share state. Counts loads and saves so tests can observe how often
/// the medium is touched.
#[derive(Debug, Clone, Default)]
pub struct MemorySecureStorage {
    inner: Arc<RwLock<HashMap<String, Credential>>>,
    loads: Arc<std::sync::atomic::AtomicUsize>,
    saves: Arc<std::sync::atomic::AtomicUsize>,
}

impl MemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with a credential for `account`.
    pub fn with_credential(account: impl Into<String>, credential: Credential) -> Self {
        let storage = Self::new();
        storage
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.into(), credential);
        storage
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of `save` calls served so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl SecureStorage for MemorySecureStorage {
    fn load(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(account).cloned())
    }

    fn save(&self, account: &str, credential: &Credential) -> Result<(), StoreError> {
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(account.to_string(), credential.clone());
        Ok(())
    }

    fn remove(&self, account: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(account);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
