//! AdminD Client Library
//!
//! Invokes tasks on an AdminD server through its working directory. A
//! request is a file; its progress is read back from the presence and size
//! of the sibling response and status files:
//!
//! | status file | response file | request file | state   |
//! |-------------|---------------|--------------|---------|
//! | empty       | any           | any          | READY   |
//! | non-empty   | any           | any          | ERROR   |
//! | -           | present       | any          | RUNNING |
//! | -           | -             | present      | PENDING |
//! | -           | -             | -            | GONE    |

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

use admind_common::config::{DEFAULT_MAX_INVOKE_ATTEMPTS, DEFAULT_WAIT_TIMEOUT_MS};
use admind_common::identity;
use admind_common::layout::{self, FILE_MODE};
use admind_common::{AdmindContext, TaskIdentifier, Transaction};

pub use admind_common::AsyncStatus;

const POLL_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no live server named '{0}'")]
    ServerNotFound(String),
    #[error("server directory unavailable: {}", .0.display())]
    DirectoryUnavailable(PathBuf),
    #[error("invalid task name: {0}")]
    InvalidTaskName(String),
    #[error("request payload is empty")]
    EmptyPayload,
    #[error("no unique request id after {attempts} attempts")]
    CollisionExhausted { attempts: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Transaction handle returned by [`AdmindClient::invoke`]: the full path of
/// the request file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(PathBuf);

impl RequestId {
    pub fn path(&self) -> &Path {
        &self.0
    }

    fn transaction(&self) -> Transaction {
        Transaction::new(self.0.clone())
    }
}

impl From<PathBuf> for RequestId {
    fn from(path: PathBuf) -> Self {
        RequestId(path)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

type IdSource = Arc<dyn Fn() -> String + Send + Sync>;

fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Client bound to one server working directory.
#[derive(Clone)]
pub struct AdmindClient {
    dir: PathBuf,
    wait_timeout: Duration,
    max_attempts: u32,
    id_source: IdSource,
}

impl fmt::Debug for AdmindClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmindClient")
            .field("dir", &self.dir)
            .field("wait_timeout", &self.wait_timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl AdmindClient {
    /// Finds the live server named in `context` below its root directory.
    pub fn discover(context: &AdmindContext) -> Result<Self> {
        let found = identity::discover(context.root(), context.server_name(), context.linger)
            .ok_or_else(|| ClientError::ServerNotFound(context.server_name().to_string()))?;
        debug!(dir = %found.dir.display(), token = %found.identity.token, "Server discovered");

        Ok(Self::attach(found.dir)
            .with_wait_timeout(context.wait_timeout)
            .with_max_attempts(context.max_invoke_attempts))
    }

    /// Targets a known working directory without discovery.
    pub fn attach(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_INVOKE_ATTEMPTS,
            id_source: Arc::new(random_id),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Replaces the generator of unique request ids (alphanumeric only).
    pub fn with_id_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_source = Arc::new(source);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a request for `task` carrying `data`.
    ///
    /// The request file is created exclusively; on an id collision a new id
    /// is drawn, up to the configured number of attempts.
    pub async fn invoke(
        &self,
        task: &str,
        data: impl AsRef<[u8]>,
        options: &[&str],
    ) -> Result<RequestId> {
        let data = data.as_ref();
        if data.is_empty() {
            // Zero-length requests are never picked up
            return Err(ClientError::EmptyPayload);
        }
        if !layout::probe(&self.dir) {
            return Err(ClientError::DirectoryUnavailable(self.dir.clone()));
        }

        for attempt in 1..=self.max_attempts {
            let identifier = TaskIdentifier::new(task, options, &(self.id_source)())
                .map_err(|err| ClientError::InvalidTaskName(err.to_string()))?;
            let path = identifier.request_path(&self.dir);

            let mut file = match create_request(&path).await {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(attempt, request = %path.display(), "Request id collision");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if let Err(err) = write_payload(&mut file, &path, data).await {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(err.into());
            }

            debug!(request = %path.display(), bytes = data.len(), "Request written");
            return Ok(RequestId(path));
        }

        Err(ClientError::CollisionExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Current state derived from the transaction files.
    pub fn status(&self, request: &RequestId) -> AsyncStatus {
        request.transaction().observe()
    }

    /// True once the status file exists.
    pub fn finished(&self, request: &RequestId) -> bool {
        request.transaction().is_finished()
    }

    /// Checks the status, and unless it is final, checks once more 1 ms later.
    pub async fn poll(&self, request: &RequestId) -> AsyncStatus {
        let status = self.status(request);
        if matches!(status, AsyncStatus::Ready | AsyncStatus::Error) {
            return status;
        }

        // Filesystem round trips are the unit of latency here
        sleep(POLL_PAUSE).await;
        self.status(request)
    }

    /// Polls until `awaited`, ERROR or GONE shows up.
    ///
    /// When `timeout` runs out the transaction is discarded and ERROR is
    /// returned; the server may still finish it, unobserved.
    pub async fn wait(
        &self,
        request: &RequestId,
        timeout: Duration,
        awaited: AsyncStatus,
    ) -> AsyncStatus {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() > deadline {
                debug!(%request, "Wait timed out; discarding transaction");
                self.error(request).await;
                return AsyncStatus::Error;
            }

            let status = self.poll(request).await;
            if status == awaited || matches!(status, AsyncStatus::Error | AsyncStatus::Gone) {
                return status;
            }
        }
    }

    /// [`wait`](Self::wait) for READY with the configured timeout.
    pub async fn wait_default(&self, request: &RequestId) -> AsyncStatus {
        self.wait(request, self.wait_timeout, AsyncStatus::Ready)
            .await
    }

    /// Consumes a READY transaction and returns its response.
    ///
    /// Anything but READY yields `None` and leaves the files alone.
    pub async fn response(&self, request: &RequestId) -> Option<Vec<u8>> {
        if self.status(request) != AsyncStatus::Ready {
            return None;
        }

        let transaction = request.transaction();
        let contents = read_contents(&transaction.response()).await;
        remove_transaction(&transaction);
        contents
    }

    /// Response content as it is right now, without consuming anything.
    pub async fn peek_response(&self, request: &RequestId) -> Option<Vec<u8>> {
        read_contents(&request.transaction().response()).await
    }

    /// Consumes the transaction whatever its state and returns the status
    /// text, if there was any.
    pub async fn error(&self, request: &RequestId) -> Option<String> {
        let transaction = request.transaction();
        let contents = read_contents(&transaction.status_file())
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        remove_transaction(&transaction);
        contents
    }
}

async fn create_request(path: &Path) -> io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);
    options.open(path).await
}

async fn write_payload(file: &mut tokio::fs::File, path: &Path, data: &[u8]) -> io::Result<()> {
    layout::fix_permissions(path)?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn read_contents(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Some(contents),
        Err(err) => {
            debug!(path = %path.display(), "Unable to read: {}", err);
            None
        }
    }
}

fn remove_transaction(transaction: &Transaction) {
    if let Err(err) = transaction.remove() {
        debug!(request = %transaction.request().display(), "Unable to remove transaction: {}", err);
    }
}
