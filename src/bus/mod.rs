//! Message bus collaborator contract.
//!
//! This module defines the narrow interface the RPC core requires from an
//! underlying message bus: declare a direct exchange and queues, bind by
//! routing key, publish with per-message properties, consume with explicit
//! acknowledgment, and bound in-flight deliveries with a prefetch limit.
//!
//! The bus is responsible only for delivery. Correlation, handler dispatch,
//! and reply routing are layered on top by the client and server.
//!
//! Concrete implementations live in this module's submodules: an AMQP
//! implementation backed by `lapin` (feature `transport_amqp`) and an
//! in-process implementation that serves as the reference semantics for
//! tests.

mod memory;

#[cfg(feature = "transport_amqp")]
mod amqp;

pub use memory::create_memory_bus;

#[cfg(feature = "transport_amqp")]
pub use amqp::create_amqp_bus;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Transport-level properties attached to a published message.
///
/// Both fields are present only on request/reply exchanges; events and
/// dead-letters travel without them.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    // ---
    /// Token matching a request to its reply.
    pub correlation_id: Option<String>,

    /// Queue the receiver should publish any reply to.
    pub reply_to: Option<String>,
}

impl Properties {
    /// Properties for a message that expects no reply.
    pub fn none() -> Self {
        Self::default()
    }

    /// Properties for an outgoing request expecting a correlated reply.
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        // ---
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    /// Properties for a reply, stamped with the request's correlation ID.
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        // ---
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
        }
    }
}

/// Acknowledgment hook attached to a manually-acked delivery.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge this single delivery.
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// One inbound message handed to a consumer.
pub struct Delivery {
    // ---
    /// Raw message bytes (an encoded envelope for all core traffic).
    pub payload: Bytes,

    /// Correlation ID property, if the sender attached one.
    pub correlation_id: Option<String>,

    /// Reply-to property, if the sender attached one.
    pub reply_to: Option<String>,

    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Build a delivery. `acker` is `None` for auto-acked consumers.
    pub fn new(
        payload: Bytes,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        acker: Option<Box<dyn Acknowledger>>,
    ) -> Self {
        // ---
        Self {
            payload,
            correlation_id,
            reply_to,
            acker,
        }
    }

    /// Acknowledge the delivery, exactly once.
    ///
    /// A no-op for auto-acked consumers. Consuming `self` makes a double
    /// ack unrepresentable.
    pub async fn ack(mut self) -> Result<()> {
        // ---
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

/// Handle returned from a successful `consume()`.
///
/// The consumer remains active until the handle is dropped or the bus is
/// closed.
pub struct ConsumerHandle {
    // ---
    /// Receiver channel for deliveries on the consumed queue.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// The bus topology and delivery operations the RPC core requires.
///
/// Implementations must ensure that once `consume()` returns, subsequent
/// publishes routed to that queue are deliverable, and that a prefetch limit
/// set via `qos()` bounds the number of simultaneously unacknowledged
/// deliveries per manually-acked consumer.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    // ---
    /// Declare a direct-routed exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a non-durable queue with the given name. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Declare a private, server-named queue and return its name.
    ///
    /// Used by clients as their reply-to address; lives as long as the
    /// connection.
    async fn declare_reply_queue(&self) -> Result<String>;

    /// Bind a queue to an exchange under the given routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a payload to `exchange` routed by `routing_key`.
    ///
    /// An empty exchange name addresses the default exchange, which routes
    /// directly to the queue named by the routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        props: Properties,
        payload: Bytes,
    ) -> Result<()>;

    /// Set the unacknowledged-delivery limit for subsequent consumers.
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// With `auto_ack` the bus considers each delivery settled on send and
    /// `Delivery::ack` is a no-op; otherwise deliveries count against the
    /// prefetch limit until acknowledged.
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<ConsumerHandle>;

    /// Close the bus connection and release its resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Shared bus pointer.
///
/// Cheap to clone; clones share the same underlying connection.
pub type BusPtr = Arc<dyn MessageBus>;
