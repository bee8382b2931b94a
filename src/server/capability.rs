use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// Feature handlers attached to an engine at startup, looked up by name.
///
/// The set is fixed once the engine is built.
#[derive(Default, Clone)]
pub struct Capabilities {
    handlers: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous entry.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, handler: Arc<T>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Returns the handler registered under `name` if it is a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.handlers.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Capabilities").field("names", &names).finish()
    }
}
