//! In-process message bus implementation.
//!
//! This is the reference implementation of the [`MessageBus`](super::MessageBus)
//! contract, simulating a broker entirely within the process. It exists to
//! validate the correlation and dispatch layers without network, broker, or
//! timing variability; the AMQP implementation is expected to approximate
//! this behavior.
//!
//! ## Semantics
//!
//! - The default exchange (`""`) routes directly to the queue named by the
//!   routing key.
//! - A named exchange routes to every queue bound under the routing key.
//! - Publishing to an unbound routing key or undeclared queue silently
//!   drops the message.
//! - Each queue supports one consumer; the prefetch limit is modeled by a
//!   per-consumer semaphore whose permits travel with deliveries and are
//!   released on acknowledgment.
//!
//! ## Non-goals
//!
//! - Persistence, durability, or redelivery
//! - Network behavior or failure simulation

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use super::{Acknowledger, BusPtr, ConsumerHandle, Delivery, MessageBus, Properties};
use crate::{log_debug, Result, RpcError};

type QueueItem = (Bytes, Properties);

struct QueueSlot {
    // ---
    tx: mpsc::UnboundedSender<QueueItem>,
    /// Taken by the first (and only) consumer of the queue.
    rx: Option<mpsc::UnboundedReceiver<QueueItem>>,
}

impl QueueSlot {
    fn new() -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct State {
    // ---
    exchanges: HashSet<String>,
    /// (exchange, routing key) → bound queue names.
    bindings: HashMap<(String, String), HashSet<String>>,
    queues: HashMap<String, QueueSlot>,
}

/// In-process bus. See module docs for semantics.
struct MemoryBus {
    // ---
    state: RwLock<State>,
    prefetch: AtomicU16,
}

/// Releasing the permit frees one slot of prefetch capacity.
struct MemoryAcker {
    // ---
    _permit: OwnedSemaphorePermit,
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        // Dropping self releases the permit.
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    // ---
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        // ---
        let mut state = self.state.write().await;
        state.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        // ---
        let mut state = self.state.write().await;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(QueueSlot::new);
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        // ---
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.declare_queue(&name).await?;
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        let mut state = self.state.write().await;

        if !state.queues.contains_key(queue) {
            return Err(RpcError::Transport(format!(
                "memory: bind to undeclared queue: {queue}"
            )));
        }

        state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .insert(queue.to_string());

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        props: Properties,
        payload: Bytes,
    ) -> Result<()> {
        // ---
        let state = self.state.read().await;

        // Default exchange routes straight to the queue named by the key.
        let targets: Vec<&QueueSlot> = if exchange.is_empty() {
            state.queues.get(routing_key).into_iter().collect()
        } else {
            state
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .map(|queues| {
                    queues
                        .iter()
                        .filter_map(|name| state.queues.get(name))
                        .collect()
                })
                .unwrap_or_default()
        };

        if targets.is_empty() {
            log_debug!("memory: no route for {exchange:?}/{routing_key}, dropping");
        }

        for slot in targets {
            // A closed channel means the consumer is gone; drop silently.
            let _ = slot.tx.send((payload.clone(), props.clone()));
        }

        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        // ---
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<ConsumerHandle> {
        // ---
        let mut rx = {
            let mut state = self.state.write().await;

            let slot = state.queues.get_mut(queue).ok_or_else(|| {
                RpcError::Transport(format!("memory: consume from undeclared queue: {queue}"))
            })?;

            slot.rx.take().ok_or_else(|| {
                RpcError::Transport(format!("memory: queue already has a consumer: {queue}"))
            })?
        };

        let prefetch = self.prefetch.load(Ordering::SeqCst).max(1) as usize;
        let capacity = Arc::new(Semaphore::new(prefetch));

        let (out_tx, out_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            // ---
            while let Some((payload, props)) = rx.recv().await {
                let acker: Option<Box<dyn Acknowledger>> = if auto_ack {
                    None
                } else {
                    // Blocks further deliveries once the unacked limit is hit.
                    match capacity.clone().acquire_owned().await {
                        Ok(permit) => Some(Box::new(MemoryAcker { _permit: permit })),
                        Err(_) => break,
                    }
                };

                let delivery = Delivery::new(payload, props.correlation_id, props.reply_to, acker);

                if out_tx.send(delivery).await.is_err() {
                    // Consumer handle dropped.
                    break;
                }
            }
        });

        Ok(ConsumerHandle { inbox: out_rx })
    }

    async fn close(&self) -> Result<()> {
        // ---
        let mut state = self.state.write().await;
        state.queues.clear();
        state.bindings.clear();
        state.exchanges.clear();
        Ok(())
    }
}

/// Create a new in-process bus.
///
/// Clients and servers sharing the returned pointer see the same broker
/// state, so one pointer stands in for one broker in tests.
pub fn create_memory_bus() -> BusPtr {
    // ---
    Arc::new(MemoryBus {
        state: RwLock::new(State::default()),
        prefetch: AtomicU16::new(100),
    })
}
