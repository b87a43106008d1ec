//! Configuration file and the runtime context derived from it.
//!
//! ```toml
//! [server]
//! name = "server_spock"
//! root = "/tmp/admind_spock"
//! linger_ms = 5000
//!
//! [client]
//! wait_timeout_ms = 15000
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AdmindError, Result};
use crate::identity;
use crate::layout;

pub const DEFAULT_LINGER_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_INVOKE_ATTEMPTS: u32 = 10;

pub const ENV_CONFIG: &str = "ADMIND_CONFIG";
pub const ENV_ROOT: &str = "ADMIND_ROOT";
pub const ENV_SERVER_NAME: &str = "ADMIND_SERVER_NAME";

const ROOT_PREFIX: &str = "admind_";
const SERVER_PREFIX: &str = "server_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmindConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: None,
            root: None,
            linger_ms: DEFAULT_LINGER_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_max_invoke_attempts")]
    pub max_invoke_attempts: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            max_invoke_attempts: DEFAULT_MAX_INVOKE_ATTEMPTS,
        }
    }
}

fn default_linger_ms() -> u64 {
    DEFAULT_LINGER_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_wait_timeout_ms() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

fn default_max_invoke_attempts() -> u32 {
    DEFAULT_MAX_INVOKE_ATTEMPTS
}

/// Strict parse of a configuration file.
pub fn parse_config(path: &Path) -> Result<AdmindConfig> {
    let contents = fs::read_to_string(path).map_err(|err| AdmindError::Config {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    toml::from_str(&contents).map_err(|err| AdmindError::Config {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Loads the configuration, falling back to defaults when the file is
/// missing or broken.
pub fn load_config(path: Option<&Path>) -> AdmindConfig {
    let Some(path) = path else {
        return AdmindConfig::default();
    };

    match parse_config(path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{} (using defaults)", err);
            AdmindConfig::default()
        }
    }
}

/// Config file named by `ADMIND_CONFIG`, if any.
pub fn config_path_from_env() -> Option<PathBuf> {
    env::var_os(ENV_CONFIG)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Name of the user owning this process.
pub fn current_user() -> String {
    for key in ["USER", "USERNAME", "LOGNAME"] {
        if let Ok(value) = env::var(key) {
            let value = value.trim();
            if !value.is_empty() {
                return layout::sanitize_token(value);
            }
        }
    }
    fallback_user()
}

#[cfg(target_family = "unix")]
fn fallback_user() -> String {
    let uid = nix::unistd::Uid::current();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => layout::sanitize_token(&user.name),
        _ => format!("uid{}", uid),
    }
}

#[cfg(not(target_family = "unix"))]
fn fallback_user() -> String {
    "user".to_string()
}

/// `<tmp>/admind_<user>`; the temp directory should preferably be memory
/// backed, so `/var/tmp` is swapped for `/tmp`.
pub fn default_root() -> PathBuf {
    let mut tmp = env::temp_dir();
    if tmp == Path::new("/var/tmp") || tmp == Path::new("/var/tmp/") {
        tmp = PathBuf::from("/tmp");
    }
    tmp.join(format!("{}{}", ROOT_PREFIX, current_user()))
}

pub fn default_server_name() -> String {
    format!("{}{}", SERVER_PREFIX, current_user())
}

/// Process-wide identity and timing, built once at startup and handed to
/// every component.
#[derive(Debug, Clone)]
pub struct AdmindContext {
    root: PathBuf,
    token: String,
    server_name: String,
    pub linger: Duration,
    pub heartbeat_interval: Duration,
    pub poll_timeout: Duration,
    pub retry_backoff: Duration,
    pub wait_timeout: Duration,
    pub max_invoke_attempts: u32,
}

impl AdmindContext {
    /// Applies `ADMIND_ROOT` / `ADMIND_SERVER_NAME` over the file values.
    pub fn from_config(config: &AdmindConfig) -> Self {
        let root = env::var_os(ENV_ROOT)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| config.server.root.clone())
            .unwrap_or_else(default_root);

        let server_name = env::var(ENV_SERVER_NAME)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| config.server.name.clone())
            .unwrap_or_else(default_server_name);

        Self {
            root,
            token: layout::process_token(),
            server_name,
            linger: Duration::from_millis(config.server.linger_ms),
            heartbeat_interval: Duration::from_millis(config.server.heartbeat_interval_ms),
            poll_timeout: Duration::from_millis(config.server.poll_timeout_ms),
            retry_backoff: Duration::from_millis(config.server.retry_backoff_ms),
            wait_timeout: Duration::from_millis(config.client.wait_timeout_ms),
            max_invoke_attempts: config.client.max_invoke_attempts.max(1),
        }
    }

    /// Context with default timings, independent of the environment.
    pub fn new(root: impl Into<PathBuf>, server_name: impl Into<String>) -> Self {
        let config = AdmindConfig::default();
        Self {
            root: root.into(),
            token: layout::process_token(),
            server_name: server_name.into(),
            linger: Duration::from_millis(config.server.linger_ms),
            heartbeat_interval: Duration::from_millis(config.server.heartbeat_interval_ms),
            poll_timeout: Duration::from_millis(config.server.poll_timeout_ms),
            retry_backoff: Duration::from_millis(config.server.retry_backoff_ms),
            wait_timeout: Duration::from_millis(config.client.wait_timeout_ms),
            max_invoke_attempts: config.client.max_invoke_attempts,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = layout::sanitize_token(token);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// `<root>/<token>`
    pub fn working_dir(&self) -> PathBuf {
        self.root.join(&self.token)
    }

    pub fn identity_path(&self) -> PathBuf {
        identity::identity_path(&self.working_dir(), &self.server_name)
    }
}
