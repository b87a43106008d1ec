//! Server lifecycle: directory ownership, heartbeat and the watch loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use admind_common::{layout, AdmindContext};

use crate::builtin;
use crate::dispatcher::{provision, publish_identity, Dispatcher};
use crate::heartbeat::Heartbeat;
use crate::registry::TaskRegistry;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const POSTMORTEM_LOG: &str = "postmortem.log";

/// Cloneable trigger for stopping the server, used by signal handlers and
/// the built-in `shutdown` task.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn request(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Resolves once a stop has been requested.
    pub async fn requested(&self) {
        let mut receiver = self.subscribe();
        let _ = receiver.wait_for(|stop| *stop).await;
    }
}

/// One admind server bound to its working directory.
pub struct Admind {
    context: Arc<AdmindContext>,
    registry: Arc<TaskRegistry>,
    shutdown: ShutdownHandle,
    owns_dir: bool,
    heartbeat: Option<Heartbeat>,
    dispatcher: Option<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl Admind {
    /// Builds a server with the built-in tasks registered.
    pub fn new(context: AdmindContext) -> Self {
        let shutdown = ShutdownHandle::new();
        let registry = Arc::new(TaskRegistry::new());
        builtin::register_builtins(&registry, shutdown.clone());

        Self {
            context: Arc::new(context),
            registry,
            shutdown,
            owns_dir: false,
            heartbeat: None,
            dispatcher: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn context(&self) -> &AdmindContext {
        &self.context
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn working_dir(&self) -> PathBuf {
        self.context.working_dir()
    }

    /// Execution units still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// True when this server created its directory and will remove it.
    pub fn owns_dir(&self) -> bool {
        self.owns_dir
    }

    /// Sets up the directory and launches heartbeat and watch loop.
    ///
    /// Provisioning failures are logged, not returned: the watch loop keeps
    /// retrying on its backoff.
    pub fn start(&mut self) {
        if self.dispatcher.is_some() {
            return;
        }

        let dir = self.working_dir();
        if layout::probe(&dir) {
            info!(dir = %dir.display(), "Adopting existing directory");
            // Not ours to delete, but clients must still find us
            if let Err(err) = publish_identity(&self.context, &dir) {
                warn!(dir = %dir.display(), "Unable to publish identity: {}", err);
            }
        } else {
            // Only a directory we create is ours to delete
            self.owns_dir = true;
            match provision(&self.context) {
                Ok(path) => info!(dir = %path.display(), "Directory was created"),
                Err(err) => warn!("Unable to start AdminD (will retry): {}", err),
            }
        }

        self.heartbeat = Some(Heartbeat::start(
            self.context.identity_path(),
            self.context.heartbeat_interval,
        ));

        let dispatcher = Dispatcher::new(self.context.clone(), self.registry.clone());
        self.in_flight = dispatcher.in_flight();
        self.dispatcher = Some(tokio::spawn(dispatcher.run(self.shutdown.subscribe())));
    }

    /// Stops the watch loop (waiting up to 10 s), the heartbeat, and removes
    /// the directory when this server created it.
    pub async fn stop(mut self) {
        self.shutdown.request();

        if let Some(handle) = self.dispatcher.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Watch loop ended abnormally: {}", err),
                Err(_) => warn!("Watch loop did not stop within {:?}", STOP_TIMEOUT),
            }
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        if self.owns_dir {
            let dir = self.working_dir();
            match layout::purge(&dir) {
                Ok(()) => info!(dir = %dir.display(), "Directory removed"),
                Err(err) => {
                    error!(dir = %dir.display(), "Unable to remove directory: {}", err);
                    write_postmortem(self.context.root(), &dir, &err);
                }
            }
        }
    }
}

/// Leaves a note next to the server directories when cleanup failed.
fn write_postmortem(root: &Path, dir: &Path, err: &std::io::Error) {
    let line = format!(
        "On {} error removing AdminD directory {}: {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        dir.display(),
        err
    );

    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join(POSTMORTEM_LOG))
        .and_then(|mut file| file.write_all(line.as_bytes()));

    if let Err(err) = written {
        warn!("Unable to write postmortem log: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_postmortem_appends() {
        let temp = TempDir::new().unwrap();
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");

        write_postmortem(temp.path(), &temp.path().join("1_box"), &err);
        write_postmortem(temp.path(), &temp.path().join("2_box"), &err);

        let log = fs::read_to_string(temp.path().join(POSTMORTEM_LOG)).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("1_box"));
        assert!(log.contains("nope"));
    }

    #[tokio::test]
    async fn test_shutdown_handle_resolves() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_requested());

        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.requested().await });
        handle.request();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("resolved")
            .unwrap();
        assert!(handle.is_requested());
    }
}
