//! AdminD server
//!
//! Serves task requests dropped as files into a per-process working
//! directory. Clients never talk to the server directly: they write a
//! request file, the watch loop claims it by creating the response file,
//! an execution unit runs the task and publishes a status file when done.

pub mod builtin;
pub mod dispatcher;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod unit;

pub use dispatcher::{Assignment, Dispatcher};
pub use registry::{
    FnProvider, ProviderResolver, RegistryEvent, Task, TaskIo, TaskProvider, TaskRegistry,
};
pub use server::{Admind, ShutdownHandle};
pub use unit::{ExecutionUnit, StatusStream, UnitOutcome};

pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
