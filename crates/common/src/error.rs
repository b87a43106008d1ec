use std::io;
use std::path::PathBuf;

/// Errors raised while provisioning or describing admind state on disk.
#[derive(Debug, thiserror::Error)]
pub enum AdmindError {
    /// The working directory (or its root) could not be created or secured.
    #[error("unable to set up {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid task identifier: {0}")]
    InvalidIdentifier(String),
    #[error("identity file already present: {}", .0.display())]
    IdentityExists(PathBuf),
    #[error("invalid identity file {}: {message}", path.display())]
    InvalidIdentity { path: PathBuf, message: String },
    #[error("invalid configuration {}: {message}", path.display())]
    Config { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AdmindError {
    pub(crate) fn setup(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AdmindError::Setup {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdmindError>;
