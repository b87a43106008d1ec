// Execution unit: runs one claimed transaction and finalizes its status

use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use admind_common::layout::{self, FILE_MODE};
use admind_common::{TaskIdentifier, Transaction};

use crate::registry::{TaskIo, TaskProvider};

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

pub const FAIL_STATUS_MESSAGE: &str = "Task returned fail status";

/// Diagnostic stream of a transaction, backed lazily by the scratch file.
///
/// Nothing touches the disk until the first write. [`finalize`] renames the
/// scratch file into the status artifact, creating an empty one when the
/// task wrote nothing, so a visible status always means "finished".
/// When the client has already discarded the request, the scratch file is
/// deleted instead. Dropping an unfinalized stream finalizes it.
///
/// [`finalize`]: StatusStream::finalize
pub struct StatusStream {
    request: PathBuf,
    scratch: PathBuf,
    status: PathBuf,
    file: Option<File>,
    finalized: bool,
}

impl StatusStream {
    pub fn new(transaction: &Transaction) -> Self {
        Self {
            request: transaction.request().to_path_buf(),
            scratch: transaction.scratch(),
            status: transaction.status_file(),
            file: None,
            finalized: false,
        }
    }

    /// True once diagnostics have been written.
    pub fn is_materialized(&self) -> bool {
        self.file.is_some()
    }

    fn backing(&mut self) -> io::Result<&mut File> {
        if self.finalized {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "status already finalized",
            ));
        }
        if self.file.is_none() {
            self.file = Some(open_scratch(&self.scratch)?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "status stream unavailable"))
    }

    /// Publishes the status artifact. Later calls are no-ops.
    pub fn finalize(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        if !self.request.exists() {
            drop(self.file.take());
            debug!(request = %self.request.display(), "Transaction abandoned; status discarded");
            layout::remove_if_exists(&self.scratch)?;
            return Ok(());
        }

        match self.file.take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_all()?;
            }
            None => {
                open_scratch(&self.scratch)?;
            }
        }

        fs::rename(&self.scratch, &self.status)?;
        layout::fix_permissions(&self.status)
    }
}

impl Write for StatusStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.backing()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(status = %self.status.display(), "Unable to finalize status: {}", err);
        }
    }
}

fn open_scratch(path: &std::path::Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(FILE_MODE);
    options.open(path)
}

/// How a unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    Failed,
    Faulted,
}

/// Runs one provider task bound to the request (input), response (output)
/// and status (diagnostics) of a claimed transaction.
pub struct ExecutionUnit {
    transaction: Transaction,
    identifier: TaskIdentifier,
    provider: Arc<dyn TaskProvider>,
    input: File,
    output: File,
    in_flight: Option<Arc<AtomicUsize>>,
}

impl ExecutionUnit {
    pub fn new(
        transaction: Transaction,
        identifier: TaskIdentifier,
        provider: Arc<dyn TaskProvider>,
        input: File,
        output: File,
    ) -> Self {
        Self {
            transaction,
            identifier,
            provider,
            input,
            output,
            in_flight: None,
        }
    }

    /// Counter incremented while the unit runs.
    pub fn tracked_by(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.in_flight = Some(counter);
        self
    }

    /// Runs the unit on the blocking pool without waiting for it.
    pub fn spawn(self) -> JoinHandle<UnitOutcome> {
        tokio::task::spawn_blocking(move || self.run())
    }

    pub fn run(self) -> UnitOutcome {
        let ExecutionUnit {
            transaction,
            identifier,
            provider,
            mut input,
            output,
            in_flight,
        } = self;

        let _guard = in_flight.map(InFlightGuard::enter);
        let label = identifier.to_string();
        debug!(task = %label, "Execution unit started");

        // Declared before the output so it is dropped (finalized) last
        let mut status = StatusStream::new(&transaction);
        let mut output = BufWriter::new(output);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut task = provider.create_task(identifier.name(), identifier.options());
            let mut io = TaskIo {
                input: &mut input,
                output: &mut output,
                diagnostics: &mut status,
            };
            task.run(&mut io)
        }));

        let mut outcome = match result {
            Ok(Ok(true)) => UnitOutcome::Succeeded,
            Ok(Ok(false)) => {
                report(&mut status, &label, format_args!("{}", FAIL_STATUS_MESSAGE));
                UnitOutcome::Failed
            }
            Ok(Err(err)) => {
                warn!(task = %label, "Task raised {}", err);
                report(&mut status, &label, format_args!("Task raised: {:?}", err));
                UnitOutcome::Faulted
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task = %label, "Task panicked: {}", message);
                report(&mut status, &label, format_args!("Task panicked: {}", message));
                UnitOutcome::Faulted
            }
        };

        // Response must be complete before the status becomes visible
        match output.into_inner() {
            Ok(file) => {
                if let Err(err) = file.sync_all() {
                    debug!(task = %label, "Unable to sync response: {}", err);
                }
            }
            Err(err) => {
                report(
                    &mut status,
                    &label,
                    format_args!("Unable to write response: {}", err.error()),
                );
                outcome = UnitOutcome::Faulted;
            }
        }
        drop(input);

        if let Err(err) = status.finalize() {
            warn!(task = %label, "Unable to finalize status: {}", err);
        }

        debug!(task = %label, ?outcome, "Execution unit finished");
        outcome
    }
}

fn report(status: &mut StatusStream, label: &str, message: std::fmt::Arguments<'_>) {
    if let Err(err) = writeln!(status, "{}", message) {
        warn!(task = %label, "Unable to write status: {}", err);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
