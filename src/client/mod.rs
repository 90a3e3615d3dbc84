//! RPC client implementation.
//!
//! [`RpcClient`] issues correlated calls to a destination queue and
//! fire-and-forget event publications to the configured exchange, over a
//! shared bus connection.
//!
//! # Architecture
//!
//! The client declares one private, server-named reply queue at
//! construction and reuses it for every call it issues. A background
//! receive loop consumes that queue and matches each inbound reply to its
//! pending call by correlation ID.
//!
//! Each call generates a fresh correlation ID and registers a oneshot
//! completion slot in the pending table. The receive loop removes the slot
//! when the reply arrives; cancellation removes it instead if it fires
//! first. Removal happens under one mutex, so every call settles at most
//! once and a reply racing a cancellation is silently dropped.
//!
//! # Concurrency
//!
//! Multiple calls can be in flight simultaneously; each is independently
//! correlated and no ordering is guaranteed between them. Lock contention
//! on the pending table is minimal since operations are plain map
//! insert/remove.

mod pending;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusPtr, Delivery, Properties};
use crate::{
    // ---
    log_debug,
    log_warn,
    Code,
    CorrelationId,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
};

use pending::PendingCalls;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is the pending-call table; it has no invariants
/// spanning multiple fields, and the worst outcome of a poisoned lock is a
/// dropped reply. This avoids propagating non-`Send` poison errors across
/// async boundaries.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed). All clones share one reply
/// queue and one bus connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    bus: BusPtr,
    reply_queue: String,
    exchange: String,
    pending: Mutex<PendingCalls>,

    /// Reply receive loop handle.
    ///
    /// Held so the task isn't immediately dropped; it exits on its own when
    /// the last client clone goes away.
    _rx_task: JoinHandle<()>,
}

impl RpcClient {
    // ---
    /// Create a client over an explicitly provided bus.
    ///
    /// Declares the client's private reply queue and starts the background
    /// receive loop. This is the constructor to use with a shared in-memory
    /// bus in tests.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the reply queue cannot be declared
    /// or consumed.
    pub async fn with_bus(bus: BusPtr, config: &RpcConfig) -> Result<Self> {
        // ---
        let reply_queue = bus.declare_reply_queue().await?;

        // Replies are consumed auto-ack: a reply nobody awaits anymore has
        // no value worth redelivering.
        let mut handle = bus.consume(&reply_queue, true).await?;

        let bus_for_inner = bus.clone();
        let exchange = config.exchange.clone();

        // The receive loop holds only a Weak reference so dropping the last
        // client clone shuts the loop down.
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            // ---
            let weak = weak.clone();

            let rx_task = tokio::spawn(async move {
                // ---
                while let Some(delivery) = handle.inbox.recv().await {
                    match weak.upgrade() {
                        Some(inner) => {
                            let client = RpcClient { inner };
                            client.handle_reply(delivery);
                        }
                        None => break,
                    }
                }

                log_debug!("reply consumer loop ended");
            });

            Inner {
                // ---
                bus: bus_for_inner,
                reply_queue,
                exchange,
                pending: Mutex::new(PendingCalls::new()),
                _rx_task: rx_task,
            }
        });

        Ok(Self { inner })
    }

    /// Convenience constructor that creates the crate-default bus first.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if bus creation or the reply
    /// subscription fails.
    pub async fn new(config: &RpcConfig) -> Result<Self> {
        // ---
        let bus = crate::create_bus(config).await?;
        Self::with_bus(bus, config).await
    }

    /// Issue a call and await its correlated reply.
    ///
    /// Publishes `{body, code, error: false}` to `queue` via the default
    /// exchange, stamped with a fresh correlation ID and this client's
    /// reply-to queue, then suspends until the reply arrives.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` - the remote handler reported a failure
    /// - `RpcError::Decode` - the request body could not be serialized or
    ///   the reply envelope could not be decoded
    /// - `RpcError::Transport` - publish failed or the bus shut down
    pub async fn call(
        &self,
        queue: &str,
        code: impl Into<Code>,
        body: impl Serialize,
    ) -> Result<Envelope> {
        // ---
        self.call_with_cancel(queue, code, body, CancellationToken::new())
            .await
    }

    /// Issue a call that can be abandoned through `cancel`.
    ///
    /// If `cancel` fires before the reply arrives, the pending call is
    /// removed and the call fails with `RpcError::Cancelled`; a reply
    /// arriving afterward no longer resolves anything and is silently
    /// dropped.
    pub async fn call_with_cancel(
        &self,
        queue: &str,
        code: impl Into<Code>,
        body: impl Serialize,
        cancel: CancellationToken,
    ) -> Result<Envelope> {
        // ---
        let code = code.into();
        let envelope = Envelope::new(code, serde_json::to_value(body)?);
        let payload = envelope.encode()?;

        let correlation_id = CorrelationId::generate();

        let mut rx = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.register(&correlation_id)
        };

        let props = Properties::request(correlation_id.as_str(), &self.inner.reply_queue);

        if let Err(e) = self.inner.bus.publish("", queue, props, payload).await {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.cancel(correlation_id.as_str());
            return Err(e);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut pending = lock_ignore_poison(&self.inner.pending);
                pending.cancel(correlation_id.as_str());
                Err(RpcError::Cancelled)
            }
            settled = &mut rx => {
                settled.map_err(|_| {
                    RpcError::Transport("reply channel closed before settlement".to_string())
                })?
            }
        }
    }

    /// Issue a call with a deadline.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Timeout` if no reply arrives within `timeout`;
    /// the pending call is removed so a late reply is dropped.
    pub async fn call_with_timeout(
        &self,
        queue: &str,
        code: impl Into<Code>,
        body: impl Serialize,
        timeout: Duration,
    ) -> Result<Envelope> {
        // ---
        let cancel = CancellationToken::new();

        let call = self.call_with_cancel(queue, code, body, cancel.clone());
        tokio::pin!(call);

        match time::timeout(timeout, &mut call).await {
            Ok(settled) => settled,
            Err(_) => {
                // Fire the token and drive the call to its cancelled
                // settlement so the pending entry is removed, not leaked.
                cancel.cancel();
                let _ = call.await;
                Err(RpcError::Timeout)
            }
        }
    }

    /// Issue a call and decode the reply body into `T`.
    ///
    /// A decode failure surfaces as `RpcError::Decode`, distinct from a
    /// remote-reported failure.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        queue: &str,
        code: impl Into<Code>,
        body: impl Serialize,
    ) -> Result<T> {
        // ---
        let envelope = self.call(queue, code, body).await?;
        envelope.decode_body()
    }

    /// Publish a fire-and-forget event, routed by its code.
    ///
    /// Encodes `{body, code, error: false}` and publishes it to the
    /// configured exchange under the code's routing key. No correlation
    /// tracking, no reply expected.
    pub async fn publish(&self, code: impl Into<Code>, body: impl Serialize) -> Result<()> {
        // ---
        let code = code.into();
        let routing_key = code.routing_key();

        let envelope = Envelope::new(code, serde_json::to_value(body)?);
        let payload = envelope.encode()?;

        self.inner
            .bus
            .publish(&self.inner.exchange, &routing_key, Properties::none(), payload)
            .await
    }

    /// Publish a raw serializable body to an arbitrary exchange.
    ///
    /// No envelope framing and no routing key; consumers on that exchange
    /// define their own payload contract.
    pub async fn publish_to_exchange(&self, exchange: &str, body: impl Serialize) -> Result<()> {
        // ---
        let payload = serde_json::to_vec(&body)?;

        self.inner
            .bus
            .publish(exchange, "", Properties::none(), payload.into())
            .await
    }

    /// The private queue replies to this client are routed to.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Dispatch one inbound delivery from the reply queue.
    ///
    /// Runs on the receive loop's task, never the caller's: removes the
    /// matching pending call (a miss means the call was already settled or
    /// cancelled, and the reply is dropped silently), then settles the slot
    /// with the decoded envelope or the remote failure it carries.
    fn handle_reply(&self, delivery: Delivery) {
        // ---
        let Some(correlation_id) = delivery.correlation_id.as_deref() else {
            log_warn!("reply delivery missing correlation id, dropping");
            return;
        };

        let tx = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.take(correlation_id)
        };

        let Some(tx) = tx else {
            log_debug!("no pending call for correlation id: {correlation_id}");
            return;
        };

        let settlement = match Envelope::decode(&delivery.payload) {
            Ok(envelope) if envelope.error => Err(RpcError::Remote(envelope.failure_text())),
            Ok(envelope) => Ok(envelope),
            Err(e) => Err(e),
        };

        if tx.send(settlement).is_err() {
            log_debug!("reply arrived after call abandoned (correlation id: {correlation_id})");
        }
    }
}
