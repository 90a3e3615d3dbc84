//! RPC server implementation.
//!
//! [`RpcServer`] owns the consuming side: it declares the work topology,
//! binds the work queue to every registered code, and runs the consumption
//! loop that notifies event callbacks, awaits the request handler, publishes
//! correlated replies or dead-letters unroutable failures, and acknowledges
//! each delivery exactly once.
//!
//! # Lifecycle
//!
//! `Stopped → Starting → Subscribed → Stopping → Stopped`. Registries are
//! attached before `start()` and are read-only afterwards. `stop()` is
//! abrupt: the bus is closed without draining in-flight handler tasks;
//! unacknowledged deliveries fall back to the bus's own redelivery policy.
//!
//! # Concurrency
//!
//! Each delivery is dispatched on its own spawned task, so a slow handler
//! never stalls the loop; the number of simultaneously unacknowledged
//! deliveries — and therefore in-flight tasks — is bounded solely by the
//! configured prefetch limit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::bus::{BusPtr, Delivery, Properties};
use crate::registry::{lock_ignore_poison, EventRegistry, RequestRegistry};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    Code,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
};

/// Consumption lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not consuming; the initial and final state.
    Stopped,
    /// Declaring topology and binding codes.
    Starting,
    /// Consumption loop running.
    Subscribed,
    /// Closing the bus; no new deliveries accepted.
    Stopping,
}

/// RPC server: binds queues for all registered codes and runs the
/// consumption loop.
pub struct RpcServer {
    // ---
    bus: BusPtr,
    config: RpcConfig,
    events: Vec<Arc<EventRegistry>>,
    requests: Option<Arc<RequestRegistry>>,
    state: Mutex<ServerState>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

/// Everything one dispatch task needs, cloned cheaply per delivery.
struct Dispatcher {
    // ---
    bus: BusPtr,
    events: Vec<Arc<EventRegistry>>,
    requests: Option<Arc<RequestRegistry>>,
    exceptions_queue: String,
}

impl RpcServer {
    // ---
    /// Create a server over an explicitly provided bus.
    pub fn with_bus(bus: BusPtr, config: RpcConfig) -> Self {
        // ---
        Self {
            bus,
            config,
            events: Vec::new(),
            requests: None,
            state: Mutex::new(ServerState::Stopped),
            loop_task: Mutex::new(None),
        }
    }

    /// Convenience constructor that creates the crate-default bus first.
    pub async fn new(config: RpcConfig) -> Result<Self> {
        // ---
        let bus = crate::create_bus(&config).await?;
        Ok(Self::with_bus(bus, config))
    }

    /// Attach an event registry. Several may coexist, one per subsystem.
    pub fn with_event_registry(mut self, registry: Arc<EventRegistry>) -> Self {
        // ---
        self.events.push(registry);
        self
    }

    /// Attach the request registry. At most one per server.
    pub fn with_request_registry(mut self, registry: Arc<RequestRegistry>) -> Self {
        // ---
        self.requests = Some(registry);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *lock_ignore_poison(&self.state)
    }

    /// The bus this server consumes from.
    pub fn bus(&self) -> BusPtr {
        self.bus.clone()
    }

    /// Declare topology, bind registered codes, and start consuming.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the server is not stopped or any
    /// topology operation fails. On failure the state returns to `Stopped`.
    pub async fn start(&self) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if *state != ServerState::Stopped {
                return Err(RpcError::Transport(format!(
                    "server cannot start from state {:?}",
                    *state
                )));
            }
            *state = ServerState::Starting;
        }

        match self.subscribe().await {
            Ok(()) => {
                *lock_ignore_poison(&self.state) = ServerState::Subscribed;
                Ok(())
            }
            Err(e) => {
                *lock_ignore_poison(&self.state) = ServerState::Stopped;
                Err(e)
            }
        }
    }

    async fn subscribe(&self) -> Result<()> {
        // ---
        let queue = self.config.queue.clone();
        let exceptions_queue = self.config.exceptions_queue();

        // Cap unacknowledged deliveries before any consumption begins.
        self.bus.qos(self.config.prefetch_count).await?;

        self.bus.declare_exchange(&self.config.exchange).await?;
        self.bus.declare_queue(&queue).await?;
        self.bus.declare_queue(&exceptions_queue).await?;

        for code in self.interest_set() {
            self.bus
                .bind_queue(&queue, &self.config.exchange, &code.routing_key())
                .await?;
        }

        let mut handle = self.bus.consume(&queue, false).await?;

        log_info!(
            "serving queue {queue} (prefetch {})",
            self.config.prefetch_count
        );

        let dispatcher = Arc::new(Dispatcher {
            bus: self.bus.clone(),
            events: self.events.clone(),
            requests: self.requests.clone(),
            exceptions_queue,
        });

        let task = tokio::spawn(async move {
            // ---
            while let Some(delivery) = handle.inbox.recv().await {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(delivery).await;
                });
            }

            log_debug!("consumption loop ended");
        });

        *lock_ignore_poison(&self.loop_task) = Some(task);

        Ok(())
    }

    /// Union of every registry's interest set.
    fn interest_set(&self) -> Vec<Code> {
        // ---
        let mut seen = HashSet::new();
        let mut codes = Vec::new();

        let registries = self
            .events
            .iter()
            .flat_map(|r| r.codes())
            .chain(self.requests.iter().flat_map(|r| r.codes()));

        for code in registries {
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        codes
    }

    /// Close the bus and stop consuming.
    ///
    /// Abrupt by design: in-flight handler invocations are not awaited.
    /// Idempotent; stopping a stopped server is a no-op.
    pub async fn stop(&self) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if *state == ServerState::Stopped {
                return Ok(());
            }
            *state = ServerState::Stopping;
        }

        self.bus.close().await?;

        if let Some(task) = lock_ignore_poison(&self.loop_task).take() {
            task.abort();
        }

        *lock_ignore_poison(&self.state) = ServerState::Stopped;
        log_info!("server stopped");

        Ok(())
    }
}

impl Dispatcher {
    /// Handle one delivery end to end, acknowledging it exactly once after
    /// notification, handling, and reply publication have all completed.
    async fn dispatch(&self, delivery: Delivery) {
        // ---
        let envelope = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Garbage must not wedge the queue: dead-letter and move on.
                log_error!("undecodable delivery: {e}");
                self.dead_letter(Envelope::failure(Code::from("malformed"), e.to_string()))
                    .await;
                Self::ack(delivery).await;
                return;
            }
        };

        // Event notification precedes request handling.
        for registry in &self.events {
            registry.notify(&envelope.code, &envelope);
        }
        if let Some(requests) = &self.requests {
            requests.notify(&envelope.code, &envelope);
        }

        if let Some(requests) = &self.requests {
            self.handle_request(requests, &envelope, &delivery).await;
        }

        Self::ack(delivery).await;
    }

    async fn handle_request(
        &self,
        requests: &RequestRegistry,
        envelope: &Envelope,
        delivery: &Delivery,
    ) {
        // ---
        let correlation = match (&delivery.correlation_id, &delivery.reply_to) {
            (Some(correlation_id), Some(reply_to)) => Some((correlation_id, reply_to)),
            _ => None,
        };

        match requests.handle(&envelope.code, envelope).await {
            Ok(Some(reply)) => {
                if let Some((correlation_id, reply_to)) = correlation {
                    let reply = Envelope::new(envelope.code.clone(), reply);
                    self.publish_reply(reply, correlation_id, reply_to).await;
                }
                // An uncorrelated delivery gets no reply even on success.
            }
            Ok(None) => {
                // Absent: the handler declined to reply.
            }
            Err(e) => {
                let failure = Envelope::failure(envelope.code.clone(), e.to_string());
                match correlation {
                    Some((correlation_id, reply_to)) => {
                        self.publish_reply(failure, correlation_id, reply_to).await;
                    }
                    None => {
                        // No addressable recipient: dead-letter instead.
                        self.dead_letter(failure).await;
                    }
                }
            }
        }
    }

    async fn publish_reply(&self, envelope: Envelope, correlation_id: &str, reply_to: &str) {
        // ---
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log_error!("failed to encode reply: {e}");
                return;
            }
        };

        let props = Properties::reply(correlation_id);

        if let Err(e) = self.bus.publish("", reply_to, props, payload).await {
            log_error!("failed to publish reply to {reply_to}: {e}");
        }
    }

    async fn dead_letter(&self, envelope: Envelope) {
        // ---
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log_error!("failed to encode dead-letter: {e}");
                return;
            }
        };

        if let Err(e) = self
            .bus
            .publish("", &self.exceptions_queue, Properties::none(), payload)
            .await
        {
            log_error!("failed to dead-letter to {}: {e}", self.exceptions_queue);
        }
    }

    async fn ack(delivery: Delivery) {
        // ---
        if let Err(e) = delivery.ack().await {
            log_error!("failed to ack delivery: {e}");
        }
    }
}
