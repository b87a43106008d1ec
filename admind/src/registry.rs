//! Task providers and the registry the dispatcher resolves them from.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{error, info};

const EVENT_BUFFER: usize = 64;

/// Streams bound to one transaction: the request payload, the response and
/// the diagnostic (status) output.
pub struct TaskIo<'a> {
    pub input: &'a mut dyn Read,
    pub output: &'a mut dyn Write,
    pub diagnostics: &'a mut dyn Write,
}

/// One runnable task. `Ok(true)` is success, `Ok(false)` a plain failure and
/// `Err` a fault; panics are treated as faults too.
pub trait Task: Send {
    fn run(&mut self, io: &mut TaskIo<'_>) -> anyhow::Result<bool>;
}

impl<F> Task for F
where
    F: FnMut(&mut TaskIo<'_>) -> anyhow::Result<bool> + Send,
{
    fn run(&mut self, io: &mut TaskIo<'_>) -> anyhow::Result<bool> {
        self(io)
    }
}

/// Creates tasks for the names it is registered under.
pub trait TaskProvider: Send + Sync {
    fn create_task(&self, name: &str, options: &[String]) -> Box<dyn Task>;
}

/// Name lookup capability consumed by the dispatcher.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn TaskProvider>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    Unregistered(String),
}

/// Concurrent name → provider map with change notifications.
pub struct TaskRegistry {
    providers: RwLock<HashMap<String, Arc<dyn TaskProvider>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _receiver) = broadcast::channel(EVENT_BUFFER);
        Self {
            providers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Registers `provider` under `name`, replacing any previous provider.
    /// Returns false (and registers nothing) for an empty name.
    pub fn register(&self, name: &str, provider: Arc<dyn TaskProvider>) -> bool {
        let name = name.trim();
        if name.is_empty() {
            error!("Task provider registered without a name");
            return false;
        }

        info!(task = name, "Registering task provider");
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), provider);
        let _ = self.events.send(RegistryEvent::Registered(name.to_string()));
        true
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn TaskProvider>> {
        let removed = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        if removed.is_some() {
            info!(task = name, "Unregistering task provider");
            let _ = self
                .events
                .send(RegistryEvent::Unregistered(name.to_string()));
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

impl ProviderResolver for TaskRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn TaskProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Provider backed by a closure, handy for small tasks.
pub struct FnProvider<F>(pub F);

impl<F> TaskProvider for FnProvider<F>
where
    F: Fn(&str, &[String]) -> Box<dyn Task> + Send + Sync,
{
    fn create_task(&self, name: &str, options: &[String]) -> Box<dyn Task> {
        (self.0)(name, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn constant(result: bool) -> Arc<dyn TaskProvider> {
        Arc::new(FnProvider(move |_name: &str, _options: &[String]| {
            Box::new(move |_io: &mut TaskIo<'_>| -> anyhow::Result<bool> { Ok(result) })
                as Box<dyn Task>
        }))
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = TaskRegistry::new();
        assert!(registry.resolve("noop").is_none());

        assert!(registry.register("noop", constant(true)));
        assert!(registry.contains("noop"));
        assert!(registry.resolve("noop").is_some());
        assert_eq!(registry.names(), vec!["noop".to_string()]);

        assert!(registry.unregister("noop").is_some());
        assert!(registry.resolve("noop").is_none());
        assert!(registry.unregister("noop").is_none());
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let registry = TaskRegistry::new();
        assert!(!registry.register("  ", constant(true)));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_register_replaces_previous_provider() {
        let registry = TaskRegistry::new();
        registry.register("task", constant(false));
        registry.register("task", constant(true));

        let provider = registry.resolve("task").unwrap();
        let mut task = provider.create_task("task", &[]);
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let mut diagnostics = Vec::new();
        let mut io = TaskIo {
            input: &mut input,
            output: &mut output,
            diagnostics: &mut diagnostics,
        };
        assert!(task.run(&mut io).unwrap());
    }

    #[test]
    fn test_subscribe_sees_changes() {
        let registry = TaskRegistry::new();
        let mut events = registry.subscribe();

        registry.register("a", constant(true));
        registry.unregister("a");
        registry.unregister("missing");

        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Registered("a".into()));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Unregistered("a".into()));
        assert!(events.try_recv().is_err());
    }
}
