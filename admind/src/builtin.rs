// Built-in tasks available on every server

use std::sync::Arc;

use tracing::info;

use crate::registry::{Task, TaskIo, TaskProvider, TaskRegistry};
use crate::server::ShutdownHandle;

pub const ECHO: &str = "echo";
pub const SHUTDOWN: &str = "shutdown";

/// Provider behind the built-in task names.
pub struct BuiltinProvider {
    shutdown: ShutdownHandle,
}

impl BuiltinProvider {
    pub fn new(shutdown: ShutdownHandle) -> Self {
        Self { shutdown }
    }
}

impl TaskProvider for BuiltinProvider {
    fn create_task(&self, name: &str, options: &[String]) -> Box<dyn Task> {
        info!(task = name, ?options, "Built-in task");
        match name {
            SHUTDOWN => Box::new(ShutdownTask {
                shutdown: self.shutdown.clone(),
            }),
            _ => Box::new(EchoTask),
        }
    }
}

pub fn register_builtins(registry: &TaskRegistry, shutdown: ShutdownHandle) {
    let provider: Arc<dyn TaskProvider> = Arc::new(BuiltinProvider::new(shutdown));
    registry.register(ECHO, provider.clone());
    registry.register(SHUTDOWN, provider);
}

/// Answers with the request payload in upper case.
pub struct EchoTask;

impl Task for EchoTask {
    fn run(&mut self, io: &mut TaskIo<'_>) -> anyhow::Result<bool> {
        let mut payload = Vec::new();
        io.input.read_to_end(&mut payload)?;

        let answer = match String::from_utf8(payload) {
            Ok(text) => text.to_uppercase().into_bytes(),
            Err(raw) => raw.into_bytes().to_ascii_uppercase(),
        };
        io.output.write_all(&answer)?;
        Ok(true)
    }
}

/// Asks the hosting server to stop.
pub struct ShutdownTask {
    shutdown: ShutdownHandle,
}

impl Task for ShutdownTask {
    fn run(&mut self, _io: &mut TaskIo<'_>) -> anyhow::Result<bool> {
        info!("Shutdown requested by task");
        self.shutdown.request();
        Ok(true)
    }
}
