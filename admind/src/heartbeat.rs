// Keep-alive loop for the identity file

use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use admind_common::identity;

/// Touches the identity file at a fixed interval so discovery keeps
/// treating this server as alive. Stopping never deletes the file.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(path: PathBuf, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Missing while the directory is being recreated
                if let Err(err) = identity::touch(&path) {
                    debug!(identity = %path.display(), "Heartbeat skipped: {}", err);
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        debug!("Stopping heartbeat");
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
