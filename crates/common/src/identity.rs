//! Identity/heartbeat file used to discover live servers.
//!
//! Every server publishes `<serverName>.properties` inside its working
//! directory and keeps touching it. Clients scan the root directory and only
//! accept identity files that were touched recently enough.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AdmindError, Result};
use crate::layout::{self, FILE_MODE};

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

pub const IDENTITY_SUFFIX: &str = ".properties";

/// Key/value properties stored in the identity file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    #[serde(rename = "server.name")]
    pub server_name: String,
    #[serde(rename = "server.token")]
    pub token: String,
    #[serde(rename = "server.pid")]
    pub pid: u32,
    #[serde(rename = "server.started")]
    pub started_at: DateTime<Utc>,
}

impl ServerIdentity {
    pub fn new(server_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            token: token.into(),
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// A live server found by [`discover`].
#[derive(Debug, Clone)]
pub struct DiscoveredServer {
    pub dir: PathBuf,
    pub identity: ServerIdentity,
}

pub fn identity_path(dir: &Path, server_name: &str) -> PathBuf {
    dir.join(format!("{}{}", server_name, IDENTITY_SUFFIX))
}

/// Creates the identity file; fails with [`AdmindError::IdentityExists`]
/// when one is already there.
pub fn publish(dir: &Path, identity: &ServerIdentity) -> Result<PathBuf> {
    let path = identity_path(dir, &identity.server_name);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(target_family = "unix")]
    options.mode(FILE_MODE);

    let mut file = match options.open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(AdmindError::IdentityExists(path));
        }
        Err(err) => return Err(err.into()),
    };
    layout::fix_permissions(&path)?;

    let body = toml::to_string(identity).map_err(|err| AdmindError::InvalidIdentity {
        path: path.clone(),
        message: err.to_string(),
    })?;
    writeln!(file, "# Properties for {}", identity.token)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;

    Ok(path)
}

pub fn read_identity(path: &Path) -> Result<ServerIdentity> {
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|err| AdmindError::InvalidIdentity {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Refreshes the modification time of an identity file.
pub fn touch(path: &Path) -> io::Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_modified(SystemTime::now())
}

/// True when `modified` lies within `linger` of `now`.
///
/// Timestamps in the future count as fresh.
pub fn is_fresh(modified: SystemTime, linger: Duration, now: SystemTime) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age <= linger,
        Err(_) => true,
    }
}

/// Looks for a live server called `server_name` below `root`.
///
/// Stale directories are skipped, never removed: a slow heartbeat or clock
/// skew must not destroy another process's state. When several servers are
/// valid, the first in directory listing order wins.
pub fn discover(root: &Path, server_name: &str, linger: Duration) -> Option<DiscoveredServer> {
    let entries = fs::read_dir(root).ok()?;
    let now = SystemTime::now();

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let path = identity_path(&dir, server_name);
        let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };

        if !is_fresh(modified, linger, now) {
            debug!(dir = %dir.display(), "skipping stale server directory");
            continue;
        }

        let identity = match read_identity(&path) {
            Ok(identity) => identity,
            Err(err) => {
                debug!(path = %path.display(), "unreadable identity file: {}", err);
                continue;
            }
        };

        if identity.server_name == server_name && layout::probe(&dir) {
            return Some(DiscoveredServer { dir, identity });
        }
    }

    None
}
