use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::lock_ignore_poison;
use crate::{log_debug, Code, Envelope};

/// Callback invoked with each event envelope for its code.
pub type EventCallback = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Registry of fire-and-forget event callbacks.
///
/// Binds at most one callback per code within this registry; a code may
/// carry callbacks across several registries on the same server. Dispatch
/// never blocks the caller: each invocation runs on its own spawned task,
/// so a panicking callback is isolated from the consumption loop and from
/// other callbacks.
#[derive(Default)]
pub struct EventRegistry {
    // ---
    callbacks: Mutex<HashMap<Code, EventCallback>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest in `code` and bind `callback` for it.
    ///
    /// Binding the same code twice replaces the earlier callback.
    pub fn on(&self, code: impl Into<Code>, callback: impl Fn(Envelope) + Send + Sync + 'static) {
        // ---
        let mut callbacks = lock_ignore_poison(&self.callbacks);
        callbacks.insert(code.into(), Arc::new(callback));
    }

    /// The codes this registry is interested in.
    pub fn codes(&self) -> Vec<Code> {
        // ---
        let callbacks = lock_ignore_poison(&self.callbacks);
        callbacks.keys().cloned().collect()
    }

    /// Invoke the callback bound to `code`, if any, on its own task.
    pub(crate) fn notify(&self, code: &Code, envelope: &Envelope) {
        // ---
        let callback = {
            let callbacks = lock_ignore_poison(&self.callbacks);
            callbacks.get(code).cloned()
        };

        if let Some(callback) = callback {
            let envelope = envelope.clone();
            tokio::spawn(async move {
                callback(envelope);
            });
        } else {
            log_debug!("no event callback bound for code: {code}");
        }
    }
}
