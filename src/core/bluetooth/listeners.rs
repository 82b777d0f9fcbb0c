//! Registered callbacks for session events

use std::sync::{Arc, Mutex};

use crate::utils::lock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A shared list of handlers invoked for every emitted value.
///
/// Handlers run on the emitting task, outside the list lock, so a handler may
/// register further handlers without deadlocking.
pub struct Listeners<T> {
    handlers: Arc<Mutex<Vec<Handler<T>>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        lock(&self.handlers).push(Arc::new(handler));
    }

    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = lock(&self.handlers).clone();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.handlers).is_empty()
    }
}
