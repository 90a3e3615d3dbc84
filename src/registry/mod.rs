//! Handler registries.
//!
//! Two capability sets over the same "codes of interest" contract: an event
//! registry mapping codes to fire-and-forget callbacks, and a request
//! registry that additionally binds at most one awaited handler per code.
//!
//! Registrations are established at startup and read-only while a server is
//! running. Several event registries may coexist on one server (one per
//! subsystem, say); at most one request registry is active per server.

mod event;
mod request;

pub use event::EventRegistry;
pub use request::RequestRegistry;

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Registry maps have no invariants spanning multiple fields; the worst
/// outcome of a poisoned lock is a missed callback, and propagating the
/// non-`Send` poison error across async boundaries is not worth that.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
