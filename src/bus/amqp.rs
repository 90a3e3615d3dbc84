//! AMQP bus implementation using `lapin`.
//!
//! Follows an actor-based concurrency model: a single background task owns
//! the AMQP connection and channel, and every topology or delivery operation
//! is serialized through a command channel. No other task ever touches the
//! connection directly, which preserves the `Send + Sync` bus contract
//! while respecting the AMQP client's connection semantics.
//!
//! ## Delivery semantics
//!
//! - One bus instance corresponds to a single broker connection and a
//!   single channel shared by all operations on that instance.
//! - Correlation-id and reply-to travel as AMQP `BasicProperties`; the
//!   envelope body is opaque bytes to this layer.
//! - Consumers translate broker deliveries into [`Delivery`] values and
//!   forward them into per-consumer inboxes; manual-ack consumers carry the
//!   broker acker with each delivery.
//! - Queues are declared non-durable; the client reply queue is exclusive
//!   and server-named.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Acknowledger, BusPtr, ConsumerHandle, Delivery, MessageBus, Properties};
use crate::{log_debug, log_error, log_info, Result, RpcConfig, RpcError};

//
// Actor commands
//

enum Cmd {
    //
    DeclareExchange {
        name: String,
        resp: oneshot::Sender<Result<()>>,
    },
    DeclareQueue {
        name: String,
        resp: oneshot::Sender<Result<()>>,
    },
    DeclareReplyQueue {
        resp: oneshot::Sender<Result<String>>,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        exchange: String,
        routing_key: String,
        props: Properties,
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Qos {
        prefetch_count: u16,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: String,
        auto_ack: bool,
        resp: oneshot::Sender<Result<ConsumerHandle>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP bus handle. Cheap to clone via [`BusPtr`].
struct AmqpBus {
    // ---
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpBus {
    async fn send_cmd(&self, cmd: Cmd) -> Result<()> {
        // ---
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: actor command channel closed: {e}")))
    }
}

/// Wraps the broker acker so a delivery can be settled off the actor task.
struct AmqpAcker {
    // ---
    acker: lapin::acker::Acker,
}

#[async_trait::async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        // ---
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumer_tasks: HashMap<String, JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("AMQP actor started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_cmd(cmd).await.is_break() {
                break;
            }
        }

        for (_, handle) in self.consumer_tasks.drain() {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("AMQP actor stopped");
    }

    async fn handle_cmd(&mut self, cmd: Cmd) -> std::ops::ControlFlow<()> {
        // ---
        match cmd {
            Cmd::DeclareExchange { name, resp } => {
                let _ = resp.send(self.do_declare_exchange(&name).await);
            }
            Cmd::DeclareQueue { name, resp } => {
                let _ = resp.send(self.do_declare_queue(&name).await);
            }
            Cmd::DeclareReplyQueue { resp } => {
                let _ = resp.send(self.do_declare_reply_queue().await);
            }
            Cmd::Bind {
                queue,
                exchange,
                routing_key,
                resp,
            } => {
                let _ = resp.send(self.do_bind(&queue, &exchange, &routing_key).await);
            }
            Cmd::Publish {
                exchange,
                routing_key,
                props,
                payload,
                resp,
            } => {
                let _ = resp.send(self.do_publish(&exchange, &routing_key, props, &payload).await);
            }
            Cmd::Qos {
                prefetch_count,
                resp,
            } => {
                let _ = resp.send(self.do_qos(prefetch_count).await);
            }
            Cmd::Consume {
                queue,
                auto_ack,
                resp,
            } => {
                let _ = resp.send(self.do_consume(&queue, auto_ack).await);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                return std::ops::ControlFlow::Break(());
            }
        }

        std::ops::ControlFlow::Continue(())
    }

    async fn do_declare_exchange(&self, name: &str) -> Result<()> {
        // ---
        self.channel
            .exchange_declare(
                name.into(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: exchange declare failed: {e}")))?;

        log_info!("Declared exchange: {name}");
        Ok(())
    }

    async fn do_declare_queue(&self, name: &str) -> Result<()> {
        // ---
        self.channel
            .queue_declare(
                name.into(),
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_info!("Declared queue: {name}");
        Ok(())
    }

    async fn do_declare_reply_queue(&self) -> Result<String> {
        // ---
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare("".into(), options, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: reply queue declare failed: {e}")))?;

        let name = queue.name().as_str().to_string();
        log_info!("Declared reply queue: {name}");
        Ok(name)
    }

    async fn do_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue bind failed: {e}")))?;

        log_debug!("Bound {queue} to {exchange} under key {routing_key}");
        Ok(())
    }

    async fn do_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        props: Properties,
        payload: &[u8],
    ) -> Result<()> {
        // ---
        let mut properties = BasicProperties::default();

        if let Some(correlation_id) = props.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(reply_to) = props.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }

        self.channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("Published to {exchange:?}/{routing_key}");
        Ok(())
    }

    async fn do_qos(&self, prefetch_count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: qos failed: {e}")))?;

        log_debug!("Prefetch limit set to {prefetch_count}");
        Ok(())
    }

    async fn do_consume(&mut self, queue: &str, auto_ack: bool) -> Result<ConsumerHandle> {
        // ---
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer_tag = format!("{queue}-consumer");

        let consumer = self
            .channel
            .basic_consume(queue, &consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("Started consuming queue: {queue}");

        let (out_tx, out_rx) = mpsc::channel(16);
        let queue_name = queue.to_string();

        let handle = tokio::spawn(async move {
            // ---
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let correlation_id = delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|s| s.as_str().to_string());
                        let reply_to = delivery
                            .properties
                            .reply_to()
                            .as_ref()
                            .map(|s| s.as_str().to_string());

                        let acker: Option<Box<dyn Acknowledger>> = if auto_ack {
                            None
                        } else {
                            Some(Box::new(AmqpAcker {
                                acker: delivery.acker,
                            }))
                        };

                        let delivery = Delivery::new(
                            Bytes::from(delivery.data),
                            correlation_id,
                            reply_to,
                            acker,
                        );

                        if out_tx.send(delivery).await.is_err() {
                            log_debug!("consumer handle dropped for queue: {queue_name}");
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("amqp: consumer error on {queue_name}: {e}");
                        break;
                    }
                }
            }

            log_info!("Consumer task ended for queue: {queue_name}");
        });

        self.consumer_tasks.insert(queue.to_string(), handle);

        Ok(ConsumerHandle { inbox: out_rx })
    }
}

#[async_trait::async_trait]
impl MessageBus for AmqpBus {
    // ---
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::DeclareExchange {
            name: name.to_string(),
            resp: tx,
        })
        .await?;
        recv_resp(rx).await?
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::DeclareQueue {
            name: name.to_string(),
            resp: tx,
        })
        .await?;
        recv_resp(rx).await?
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::DeclareReplyQueue { resp: tx }).await?;
        recv_resp(rx).await?
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            resp: tx,
        })
        .await?;
        recv_resp(rx).await?
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        props: Properties,
        payload: Bytes,
    ) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            props,
            payload,
            resp: tx,
        })
        .await?;
        recv_resp(rx).await?
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Qos {
            prefetch_count,
            resp: tx,
        })
        .await?;
        recv_resp(rx).await?
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<ConsumerHandle> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Consume {
            queue: queue.to_string(),
            auto_ack,
            resp: tx,
        })
        .await?;
        recv_resp(rx).await?
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        // A closed command channel means the actor is already gone.
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;

        Ok(())
    }
}

async fn recv_resp<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    // ---
    rx.await
        .map_err(|e| RpcError::Transport(format!("amqp: actor responder dropped: {e}")))
}

/// Create a lapin-backed AMQP bus from the given configuration.
///
/// Connects to the broker immediately and spawns the owning actor task.
///
/// # Errors
///
/// Returns `RpcError::Transport` if the connection or channel cannot be
/// established.
pub async fn create_amqp_bus(config: &RpcConfig) -> Result<BusPtr> {
    // ---
    let uri = config.amqp_uri();
    log_info!("Connecting to AMQP broker: {}:{}", config.host, config.port);

    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::Transport(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    log_info!("Connected to AMQP broker");

    let (cmd_tx, cmd_rx) = mpsc::channel(16);

    let actor = Actor {
        connection,
        channel,
        cmd_rx,
        consumer_tasks: HashMap::new(),
    };

    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(Arc::new(AmqpBus { cmd_tx }))
}
