// Working directory layout for admind
//
// <root>/                  one per OS user, 0700
// <root>/<process-token>/  one per live server process, 0700

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{AdmindError, Result};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

/// Owner-only access for directories (u+rwx, go-rwx).
pub const DIR_MODE: u32 = 0o700;
/// Owner-only access for files (u+rw, go-rwx).
pub const FILE_MODE: u32 = 0o600;

/// Token identifying this process inside the root directory.
///
/// Built as `<pid>@<host>` and sanitized, so `31415@ncc1701.local` becomes
/// `31415_ncc1701_local`.
pub fn process_token() -> String {
    sanitize_token(&format!("{}@{}", std::process::id(), host_name()))
}

/// Replaces punctuation so the token is usable as a single path component.
pub fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_punctuation() || ch.is_whitespace() {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

#[cfg(target_family = "unix")]
fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(target_family = "unix"))]
fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Creates `root` and `root/token` when absent and restricts both to the owner.
///
/// Failures are returned as [`AdmindError::Setup`]; retrying is up to the caller.
pub fn ensure(root: &Path, token: &str) -> Result<PathBuf> {
    mksane(root)?;

    let dir = root.join(token);
    mksane(&dir)?;

    if !probe(&dir) {
        return Err(AdmindError::setup(
            &dir,
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                "directory is not readable, writable and searchable by its owner",
            ),
        ));
    }

    Ok(dir)
}

fn mksane(dir: &Path) -> Result<()> {
    if !dir.exists() {
        match create_dir(dir) {
            Ok(()) => debug!(dir = %dir.display(), "created directory"),
            // Lost a race against another process creating the same root
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(AdmindError::setup(dir, err)),
        }
    }

    fix_permissions(dir).map_err(|err| AdmindError::setup(dir, err))
}

#[cfg(target_family = "unix")]
fn create_dir(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .mode(DIR_MODE)
        .recursive(true)
        .create(dir)
}

#[cfg(not(target_family = "unix"))]
fn create_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Restricts a file or directory to its owner.
#[cfg(target_family = "unix")]
pub fn fix_permissions(path: &Path) -> io::Result<()> {
    let mode = if fs::metadata(path)?.is_dir() {
        DIR_MODE
    } else {
        FILE_MODE
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Windows relies on the ACLs inherited from the parent directory.
#[cfg(not(target_family = "unix"))]
pub fn fix_permissions(path: &Path) -> io::Result<()> {
    fs::metadata(path).map(|_| ())
}

/// True when `path` is a directory the current user can read, write and search.
#[cfg(target_family = "unix")]
pub fn probe(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};

    let is_dir = fs::metadata(path).map(|meta| meta.is_dir()).unwrap_or(false);
    is_dir && access(path, AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK).is_ok()
}

#[cfg(not(target_family = "unix"))]
pub fn probe(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_dir() && !meta.permissions().readonly())
        .unwrap_or(false)
}

/// Removes a directory tree, files before their parent directories.
///
/// An absent tree is not an error.
pub fn purge(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    for entry in WalkDir::new(path).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let err = io::Error::from(err);
                if err.kind() == io::ErrorKind::NotFound {
                    continue;
                }
                return Err(err);
            }
        };

        let removed = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };

        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Removes a single file, reporting whether it was there.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
