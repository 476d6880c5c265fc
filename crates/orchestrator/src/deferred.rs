//! Late-bound references between runtime components.

use std::sync::{Arc, OnceLock};

use crate::error::OrchestratorError;

/// A handle filled in once, after construction. Reads before that fail with
/// [`OrchestratorError::NotReady`] instead of blocking or panicking.
pub struct Deferred<T> {
    what: &'static str,
    slot: Arc<OnceLock<Arc<T>>>,
}

impl<T> Deferred<T> {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// Fill the handle. Returns false if it was already set.
    pub fn set(&self, value: Arc<T>) -> bool {
        self.slot.set(value).is_ok()
    }

    pub fn get(&self) -> Result<Arc<T>, OrchestratorError> {
        self.slot
            .get()
            .cloned()
            .ok_or(OrchestratorError::NotReady(self.what))
    }

    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            what: self.what,
            slot: self.slot.clone(),
        }
    }
}
