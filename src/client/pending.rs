use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::{CorrelationId, Envelope, Result};

/// Tracks calls waiting for correlated replies.
///
/// Maps correlation IDs to oneshot senders carrying the call's settlement.
/// Each entry is removed exactly once, by whichever of reply-arrival or
/// cancellation comes first; callers serialize access through one mutex, so
/// removal decides the winner and settlement is at-most-once.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<String, oneshot::Sender<Result<Envelope>>>,
}

impl PendingCalls {
    // ---

    /// Create an empty table.
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new pending call.
    ///
    /// Returns the receiver the caller suspends on.
    pub fn register(&mut self, correlation_id: &CorrelationId) -> oneshot::Receiver<Result<Envelope>> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(correlation_id.to_string(), tx);
        rx
    }

    /// Remove the pending call for `correlation_id`, handing its completion
    /// slot to the caller.
    ///
    /// `None` means the call was already settled or cancelled; the reply it
    /// matched should be discarded silently.
    pub fn take(&mut self, correlation_id: &str) -> Option<oneshot::Sender<Result<Envelope>>> {
        // ---
        self.calls.remove(correlation_id)
    }

    /// Remove a pending call without settling it.
    ///
    /// Used on cancellation and on publish failure. Returns whether an
    /// entry was present.
    pub fn cancel(&mut self, correlation_id: &str) -> bool {
        // ---
        self.calls.remove(correlation_id).is_some()
    }

    /// Number of calls still awaiting a reply.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::Code;
    use serde_json::json;

    #[test]
    fn take_settles_exactly_once() {
        // ---
        let mut pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let rx = pending.register(&correlation_id);
        assert_eq!(pending.len(), 1);

        let tx = pending.take(correlation_id.as_str()).expect("entry missing");
        assert_eq!(pending.len(), 0);

        let envelope = Envelope::new(Code::from(7), json!({"status": "ok"}));
        tx.send(Ok(envelope)).unwrap();

        let settled = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(settled.code, Code::Num(7));

        // A second take finds nothing; the reply would be dropped.
        assert!(pending.take(correlation_id.as_str()).is_none());
    }

    #[test]
    fn cancel_wins_over_late_reply() {
        // ---
        let mut pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let _rx = pending.register(&correlation_id);
        assert!(pending.cancel(correlation_id.as_str()));
        assert_eq!(pending.len(), 0);

        // The reply arriving afterward finds no entry.
        assert!(pending.take(correlation_id.as_str()).is_none());

        // Cancelling twice is a no-op.
        assert!(!pending.cancel(correlation_id.as_str()));
    }

    #[test]
    fn distinct_calls_are_independent() {
        // ---
        let mut pending = PendingCalls::new();
        let first = CorrelationId::generate();
        let second = CorrelationId::generate();

        let _rx1 = pending.register(&first);
        let _rx2 = pending.register(&second);

        assert!(pending.cancel(first.as_str()));
        assert!(pending.take(second.as_str()).is_some());
        assert_eq!(pending.len(), 0);
    }
}
