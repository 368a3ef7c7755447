use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::classify::DEFAULT_EXPIRED_STATUSES;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "transport.base_url") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Base URL relative endpoint paths are resolved against.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// Path (or absolute URL) of the token endpoint.
    #[serde(default = "default_refresh_path")]
    pub path: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// HTTP statuses that mean "credential rejected".
    #[serde(default = "default_expired_statuses")]
    pub expired_statuses: Vec<u16>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            path: default_refresh_path(),
            client_id: None,
            expired_statuses: default_expired_statuses(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory for the file backend.
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            dir: default_storage_dir(),
            account: default_account(),
            keyring_service: default_keyring_service(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Keyring => write!(f, "keyring"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            _ => Err(format!("Unknown storage backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_user_agent() -> String {
    crate::net::client::USER_AGENT.to_string()
}
const fn default_connect_timeout() -> u64 {
    10
}
const fn default_request_timeout() -> u64 {
    60
}
fn default_refresh_path() -> String {
    "/oauth/token".to_string()
}
fn default_expired_statuses() -> Vec<u16> {
    DEFAULT_EXPIRED_STATUSES.to_vec()
}
fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("authpipe")
        .join("credentials")
}
fn default_account() -> String {
    "default".to_string()
}
fn default_keyring_service() -> String {
    "authpipe".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `AUTHPIPE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save the file-level configuration to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_opt_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }

        // -- Transport --
        env_opt_str!("transport.base_url", "AUTHPIPE_BASE_URL", self.transport.base_url);
        env_str!("transport.user_agent", "AUTHPIPE_USER_AGENT", self.transport.user_agent);
        env_parse!(
            "transport.connect_timeout_secs",
            "AUTHPIPE_CONNECT_TIMEOUT",
            self.transport.connect_timeout_secs
        );
        env_parse!(
            "transport.request_timeout_secs",
            "AUTHPIPE_REQUEST_TIMEOUT",
            self.transport.request_timeout_secs
        );

        // -- Refresh --
        env_str!("refresh.path", "AUTHPIPE_REFRESH_PATH", self.refresh.path);
        env_opt_str!("refresh.client_id", "AUTHPIPE_CLIENT_ID", self.refresh.client_id);
        if let Ok(val) = std::env::var("AUTHPIPE_EXPIRED_STATUSES") {
            let statuses: Vec<u16> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if !statuses.is_empty() {
                self.refresh.expired_statuses = statuses;
                ov.record("refresh.expired_statuses", "AUTHPIPE_EXPIRED_STATUSES");
            }
        }

        // -- Storage --
        env_parse!("storage.backend", "AUTHPIPE_STORAGE_BACKEND", self.storage.backend);
        if let Ok(val) = std::env::var("AUTHPIPE_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(val);
            ov.record("storage.dir", "AUTHPIPE_STORAGE_DIR");
        }
        env_str!("storage.account", "AUTHPIPE_ACCOUNT", self.storage.account);
        env_str!(
            "storage.keyring_service",
            "AUTHPIPE_KEYRING_SERVICE",
            self.storage.keyring_service
        );

        // -- Logging --
        env_str!("logging.level", "AUTHPIPE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "AUTHPIPE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// Helper for default credential storage directory
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env-mutating tests share process state.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.transport.base_url.is_none());
        assert_eq!(config.transport.connect_timeout_secs, 10);
        assert_eq!(config.transport.request_timeout_secs, 60);
        assert!(config.transport.user_agent.starts_with("authpipe/"));
        assert_eq!(config.refresh.path, "/oauth/token");
        assert_eq!(config.refresh.expired_statuses, vec![401]);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.storage.account, "default");
        assert!(config.storage.dir.ends_with("authpipe/credentials"));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("file".parse::<StorageBackend>().unwrap(), StorageBackend::File);
        assert_eq!("Keyring".parse::<StorageBackend>().unwrap(), StorageBackend::Keyring);
        assert_eq!("memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("unknown".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_storage_backend_display() {
        assert_eq!(StorageBackend::File.to_string(), "file");
        assert_eq!(StorageBackend::Keyring.to_string(), "keyring");
        assert_eq!(StorageBackend::Memory.to_string(), "memory");
    }

    #[test]
    fn test_env_overrides_tracking() {
        let mut ov = EnvOverrides::default();
        assert!(!ov.is_overridden("transport.base_url"));
        ov.record("transport.base_url", "AUTHPIPE_BASE_URL");
        assert!(ov.is_overridden("transport.base_url"));
        assert_eq!(ov.env_var_for("transport.base_url"), Some("AUTHPIPE_BASE_URL"));
        assert_eq!(ov.all().len(), 1);
    }

    #[test]
    fn test_env_override_applies() {
        let _guard = env_lock();
        // SAFETY: env-mutating tests are serialized by env_lock().
        unsafe {
            std::env::set_var("AUTHPIPE_BASE_URL", "https://api.example.com");
            std::env::set_var("AUTHPIPE_REQUEST_TIMEOUT", "5");
            std::env::set_var("AUTHPIPE_STORAGE_BACKEND", "memory");
            std::env::set_var("AUTHPIPE_EXPIRED_STATUSES", "401, 403");
        }

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.transport.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.transport.request_timeout_secs, 5);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.refresh.expired_statuses, vec![401, 403]);
        assert!(config.env_overrides.is_overridden("transport.base_url"));
        assert!(config.env_overrides.is_overridden("storage.backend"));
        assert!(!config.env_overrides.is_overridden("refresh.path"));

        unsafe {
            std::env::remove_var("AUTHPIPE_BASE_URL");
            std::env::remove_var("AUTHPIPE_REQUEST_TIMEOUT");
            std::env::remove_var("AUTHPIPE_STORAGE_BACKEND");
            std::env::remove_var("AUTHPIPE_EXPIRED_STATUSES");
        }
    }

    #[test]
    fn test_env_unparsable_value_ignored() {
        let _guard = env_lock();
        // SAFETY: env-mutating tests are serialized by env_lock().
        unsafe {
            std::env::set_var("AUTHPIPE_CONNECT_TIMEOUT", "soon");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.transport.connect_timeout_secs, 10);
        assert!(!config.env_overrides.is_overridden("transport.connect_timeout_secs"));
        unsafe {
            std::env::remove_var("AUTHPIPE_CONNECT_TIMEOUT");
        }
    }

    #[test]
    fn test_env_bool_variants() {
        let _guard = env_lock();
        for (val, expected) in [
            ("1", true),
            ("true", true),
            ("yes", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("no", false),
            ("off", false),
        ] {
            // SAFETY: env-mutating tests are serialized by env_lock().
            unsafe {
                std::env::set_var("AUTHPIPE_LOG_JSON", val);
            }
            let mut config = Config::default();
            config.apply_env_overrides();
            assert_eq!(config.logging.json, expected, "AUTHPIPE_LOG_JSON={val}");
        }
        unsafe {
            std::env::remove_var("AUTHPIPE_LOG_JSON");
        }
    }

    #[test]
    fn test_config_load_missing_file() {
        let _guard = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.refresh.path, "/oauth/token");
    }

    #[test]
    fn test_config_load_from_file() {
        let _guard = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authpipe.toml");
        std::fs::write(
            &path,
            r#"
[transport]
base_url = "https://api.example.com"
request_timeout_secs = 15

[refresh]
path = "/v1/token"
client_id = "mobile"
expired_statuses = [401, 403]

[storage]
backend = "memory"

[logging]
level = "debug"
json = true
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.transport.request_timeout_secs, 15);
        assert_eq!(config.transport.connect_timeout_secs, 10);
        assert_eq!(config.refresh.path, "/v1/token");
        assert_eq!(config.refresh.client_id.as_deref(), Some("mobile"));
        assert_eq!(config.refresh.expired_statuses, vec![401, 403]);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let _guard = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[transport\nbase_url = ").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_config_save_and_reload() {
        let _guard = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("save_test.toml");

        let mut config = Config::default();
        config.transport.base_url = Some("https://api.example.com".to_string());
        config.refresh.client_id = Some("cli".to_string());
        config.storage.backend = StorageBackend::Keyring;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.transport.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(reloaded.refresh.client_id.as_deref(), Some("cli"));
        assert_eq!(reloaded.storage.backend, StorageBackend::Keyring);
    }
}
