//! Request/response and pub/sub semantics over an asynchronous message bus.
//!
//! This library layers correlated RPC on top of independently delivered
//! messages multiplexed over one shared connection: a client publishes a
//! request tagged with a routing queue and an operation code, then awaits
//! the reply matched back to that specific call by correlation ID. On the
//! receiving side, registries route each inbound code to zero or more
//! fire-and-forget event callbacks and at most one awaited request handler,
//! and the server's consumption loop replies, dead-letters unroutable
//! failures, and acknowledges under a bounded prefetch limit.

// Import all sub modules once...
mod bus;
mod client;
mod registry;
mod server;

mod code;
mod config;
mod correlation;
mod envelope;
mod error;

mod macros;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::RpcClient;
pub use server::{RpcServer, ServerState};

pub use registry::{EventRegistry, RequestRegistry};

pub use code::Code;
pub use config::RpcConfig;
pub use correlation::CorrelationId;
pub use envelope::Envelope;
pub use error::{Result, RpcError};

// --- bus collaborator re-exports
pub use bus::{
    //
    create_memory_bus,
    Acknowledger,
    BusPtr,
    ConsumerHandle,
    Delivery,
    MessageBus,
    Properties,
};

#[cfg(feature = "transport_amqp")]
pub use bus::create_amqp_bus;

/// Create the crate-default bus for the given configuration.
///
/// With the `transport_amqp` feature (the default) this connects to the
/// configured AMQP broker; otherwise it falls back to the in-process bus.
pub async fn create_bus(config: &RpcConfig) -> Result<BusPtr> {
    // ---
    #[cfg(feature = "transport_amqp")]
    {
        return create_amqp_bus(config).await;
    }

    #[cfg(not(feature = "transport_amqp"))]
    {
        let _ = config;
        Ok(create_memory_bus())
    }
}
