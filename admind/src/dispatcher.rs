//! Watch loop over the working directory.
//!
//! The loop keeps a filesystem watcher registered on the working directory
//! and hands every non-empty request file to [`Dispatcher::assign`]. When
//! the directory disappears the watcher is dropped, the directory is
//! recreated and watching resumes after a short backoff.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use admind_common::identity::{self, ServerIdentity};
use admind_common::layout::{self, FILE_MODE};
use admind_common::{AdmindContext, AdmindError, Transaction};

use crate::registry::ProviderResolver;
use crate::unit::ExecutionUnit;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

/// What happened to one delivery of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Claimed and handed to a new execution unit.
    Dispatched,
    /// Claimed and finished immediately with an error status.
    Rejected(String),
    /// Someone already claimed this transaction.
    ClaimLost,
    /// Not a request, or nothing to do.
    Ignored,
    /// The filesystem refused to cooperate.
    Failed(String),
}

struct DirectoryWatch {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

/// Dispatches request files found in the working directory.
pub struct Dispatcher {
    context: Arc<AdmindContext>,
    resolver: Arc<dyn ProviderResolver>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(context: Arc<AdmindContext>, resolver: Arc<dyn ProviderResolver>) -> Self {
        Self {
            context,
            resolver,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Execution units currently running.
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    pub fn working_dir(&self) -> PathBuf {
        self.context.working_dir()
    }

    /// Runs until `shutdown` turns true (or its sender goes away), or the
    /// notification channel closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let dir = self.working_dir();
        info!(dir = %dir.display(), "AdminD started");

        let mut current: Option<DirectoryWatch> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !layout::probe(&dir) {
                if current.take().is_some() {
                    warn!(dir = %dir.display(), "Directory was deleted");
                }
                match provision(&self.context) {
                    Ok(path) => info!(dir = %path.display(), "Directory was recreated"),
                    Err(err) => warn!("Unable to set up AdminD directory: {}", err),
                }
            }

            if current.is_none() && layout::probe(&dir) {
                match self.watch(&dir) {
                    Ok(registered) => {
                        current = Some(registered);
                        self.catch_up(&dir);
                    }
                    Err(err) => warn!(dir = %dir.display(), "Unable to activate watcher: {}", err),
                }
            }

            let Some(active) = current.as_mut() else {
                // Not watching; wait and retry activation
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(self.context.retry_backoff) => {}
                }
                continue;
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = timeout(self.context.poll_timeout, active.events.recv()) => {
                    match received {
                        Err(_elapsed) => {}
                        Ok(None) => {
                            info!("Notification channel closed");
                            break;
                        }
                        Ok(Some(Ok(event))) => self.handle_event(event),
                        Ok(Some(Err(err))) => warn!("Watcher error: {}", err),
                    }
                }
            }
        }

        info!(
            in_flight = self.in_flight.load(Ordering::SeqCst),
            "AdminD stopped"
        );
    }

    fn watch(&self, dir: &Path) -> notify::Result<DirectoryWatch> {
        let (sender, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = sender.send(res);
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "Watcher registered");

        Ok(DirectoryWatch {
            _watcher: watcher,
            events,
        })
    }

    fn handle_event(&self, event: Event) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }

        for path in event.paths {
            if Transaction::is_request(&path) && has_content(&path) {
                self.assign(&path);
            }
        }
    }

    /// Assigns requests that were written while nobody was watching.
    fn catch_up(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), "Unable to scan directory: {}", err);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !Transaction::is_request(&path) || !has_content(&path) {
                continue;
            }
            if Transaction::new(&path).response().exists() {
                continue;
            }
            debug!(request = %path.display(), "Catching up on pending request");
            self.assign(&path);
        }
    }

    /// Claims and starts the transaction of `request`.
    ///
    /// A transaction runs at most once: the claim is the exclusive creation
    /// of its response file, and any later delivery of the same request
    /// finds that file and backs off.
    pub fn assign(&self, request: &Path) -> Assignment {
        if !Transaction::is_request(request) {
            return Assignment::Ignored;
        }

        let transaction = Transaction::new(request);
        debug!(request = %request.display(), "assign");

        let identifier = match transaction.identifier() {
            Ok(identifier) => identifier,
            Err(_) => {
                let message = format!("Invalid task identifier: {}", file_name(request));
                return self.reject(&transaction, message);
            }
        };

        let Some(provider) = self.resolver.resolve(identifier.name()) else {
            let message = format!(
                "Task '{}' not found: {}",
                identifier.name(),
                file_name(request)
            );
            return self.reject(&transaction, message);
        };

        let output = match claim(&transaction) {
            Ok(Some(output)) => output,
            Ok(None) => {
                debug!(task = %identifier, "Transaction already claimed");
                return Assignment::ClaimLost;
            }
            Err(err) => {
                warn!(task = %identifier, "Unable to claim transaction: {}", err);
                return Assignment::Failed(err.to_string());
            }
        };

        let input = match File::open(transaction.request()) {
            Ok(input) => input,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Discarded by the client between delivery and claim
                debug!(task = %identifier, "Request vanished before dispatch");
                drop(output);
                release_claim(&transaction);
                return Assignment::Ignored;
            }
            Err(err) => {
                warn!(task = %identifier, "Unable to open request: {}", err);
                let message = format!("Unable to read request {}: {}", file_name(request), err);
                drop(output);
                if let Err(err) = write_error_status(&transaction, &message) {
                    warn!(task = %identifier, "Unable to write status: {}", err);
                }
                return Assignment::Failed(message);
            }
        };

        info!(task = %identifier, "Dispatching task");
        ExecutionUnit::new(transaction, identifier, provider, input, output)
            .tracked_by(self.in_flight.clone())
            .spawn();
        Assignment::Dispatched
    }

    /// Finishes a transaction that cannot run. The claim still comes first
    /// so the request moves through RUNNING to ERROR like any other.
    fn reject(&self, transaction: &Transaction, message: String) -> Assignment {
        match claim(transaction) {
            Ok(Some(output)) => drop(output),
            Ok(None) => return Assignment::ClaimLost,
            Err(err) => {
                warn!(request = %transaction.request().display(), "Unable to claim transaction: {}", err);
                return Assignment::Failed(err.to_string());
            }
        }
        if !transaction.request().exists() {
            release_claim(transaction);
            return Assignment::Ignored;
        }

        info!(request = %transaction.request().display(), "{}", message);
        match write_error_status(transaction, &message) {
            Ok(()) => Assignment::Rejected(message),
            Err(err) => {
                warn!(request = %transaction.request().display(), "Unable to write status: {}", err);
                Assignment::Failed(err.to_string())
            }
        }
    }
}

/// Creates the working directory and publishes the identity file.
pub(crate) fn provision(context: &AdmindContext) -> admind_common::Result<PathBuf> {
    let dir = layout::ensure(context.root(), context.token())?;
    publish_identity(context, &dir)?;
    Ok(dir)
}

/// Publishes the identity file in `dir`. One left over in the same
/// directory is kept.
pub(crate) fn publish_identity(context: &AdmindContext, dir: &Path) -> admind_common::Result<()> {
    let identity = ServerIdentity::new(context.server_name(), context.token());

    match identity::publish(dir, &identity) {
        Ok(path) => debug!(identity = %path.display(), "Identity published"),
        Err(AdmindError::IdentityExists(path)) => {
            debug!(identity = %path.display(), "Identity already present")
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Drops a claim whose request disappeared; a response file left behind
/// would read RUNNING forever.
fn release_claim(transaction: &Transaction) {
    if let Err(err) = layout::remove_if_exists(&transaction.response()) {
        warn!(response = %transaction.response().display(), "Unable to release claim: {}", err);
    }
}

/// Exclusive creation of the response file. `Ok(None)` means the
/// transaction belongs to someone else.
fn claim(transaction: &Transaction) -> io::Result<Option<File>> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(target_family = "unix")]
    options.mode(FILE_MODE);

    match options.open(transaction.response()) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err),
    }
}

/// Writes `message` to the scratch file and renames it into the status
/// artifact, so pollers never observe a partial status.
fn write_error_status(transaction: &Transaction, message: &str) -> io::Result<()> {
    let scratch = transaction.scratch();

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(FILE_MODE);

    let mut file = options.open(&scratch)?;
    writeln!(file, "{}", message)?;
    file.sync_all()?;
    drop(file);

    let status = transaction.status_file();
    fs::rename(&scratch, &status)?;
    layout::fix_permissions(&status)
}

fn has_content(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
