// tests/integration.rs
//
// End-to-end behavior over a shared in-process bus: one bus pointer stands
// in for one broker, with the server consuming the work queue and clients
// issuing correlated calls against it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use rmq_rpc::{
    //
    create_memory_bus,
    Code,
    Envelope,
    EventRegistry,
    MessageBus,
    Properties,
    RequestRegistry,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcServer,
    ServerState,
};

#[derive(Debug, Serialize, Deserialize)]
struct OrderQuery {
    id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderStatus {
    status: String,
}

fn orders_config() -> RpcConfig {
    // ---
    RpcConfig::new("localhost", "orders")
}

/// Request registry with the handlers the tests exercise:
/// code 7 answers, code 8 fails, code 11 declines to reply,
/// code 13 fails, code 21 answers slowly.
fn orders_registry() -> Arc<RequestRegistry> {
    // ---
    let registry = Arc::new(RequestRegistry::new());

    registry.on_request(7, |req: OrderQuery| async move {
        // ---
        assert_eq!(req.id, 5);
        Ok(Some(OrderStatus {
            status: "ok".to_string(),
        }))
    });

    registry.on_request(8, |_req: OrderQuery| async move {
        // ---
        Err::<Option<OrderStatus>, _>(RpcError::Transport("boom".to_string()))
    });

    registry.on_request(11, |_req: OrderQuery| async move {
        // ---
        Ok(None::<OrderStatus>)
    });

    registry.on_request(13, |_req: serde_json::Value| async move {
        // ---
        Err::<Option<OrderStatus>, _>(RpcError::Transport("boom".to_string()))
    });

    registry.on_request(21, |req: OrderQuery| async move {
        // ---
        sleep(Duration::from_millis(200)).await;
        Ok(Some(OrderStatus {
            status: format!("slow-{}", req.id),
        }))
    });

    registry
}

#[tokio::test]
async fn end_to_end_call_resolves_typed_reply() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let server =
        RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(orders_registry());
    server.start().await?;
    assert_eq!(server.state(), ServerState::Subscribed);

    let client = RpcClient::with_bus(bus, &config).await?;

    let status: OrderStatus = client.call_as("orders", 7, OrderQuery { id: 5 }).await?;
    assert_eq!(status.status, "ok");

    server.stop().await?;
    assert_eq!(server.state(), ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn remote_handler_failure_surfaces_as_remote_error() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let server =
        RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(orders_registry());
    server.start().await?;

    let client = RpcClient::with_bus(bus.clone(), &config).await?;

    let result = client.call("orders", 8, OrderQuery { id: 5 }).await;

    match result {
        Err(RpcError::Remote(text)) => assert!(text.contains("boom"), "unexpected text: {text}"),
        other => panic!("expected Remote error, got {other:?}"),
    }

    // The failure was routed back to the caller, not dead-lettered.
    let mut exceptions = bus.consume(&config.exceptions_queue(), true).await?;
    let dead = timeout(Duration::from_millis(50), exceptions.inbox.recv()).await;
    assert!(dead.is_err(), "failure was dead-lettered despite reply-to");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn absent_reply_leaves_caller_pending_until_cancelled() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let server =
        RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(orders_registry());
    server.start().await?;

    let client = RpcClient::with_bus(bus, &config).await?;

    // Handler for code 11 returns absent: no reply even though the call
    // carried correlation and reply-to.
    let result = client
        .call_with_timeout("orders", 11, OrderQuery { id: 5 }, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout)));

    // The loop is still healthy.
    let status: OrderStatus = client.call_as("orders", 7, OrderQuery { id: 5 }).await?;
    assert_eq!(status.status, "ok");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unhandled_code_is_still_acknowledged() -> Result<()> {
    // ---
    // Prefetch of 1: if the unhandled delivery were not acked, the follow-up
    // call could never be delivered.
    // ---
    let bus = create_memory_bus();
    let config = orders_config().with_prefetch_count(1);

    let registry = orders_registry();
    let server = RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(registry);
    server.start().await?;

    let client = RpcClient::with_bus(bus, &config).await?;

    // Code 9 has no bound handler; the call never resolves until cancelled.
    let cancel = CancellationToken::new();
    let pending = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client
                .call_with_cancel("orders", 9, json!({"id": 1}), cancel)
                .await
        })
    };

    sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let settled = pending.await.expect("call task panicked");
    assert!(matches!(settled, Err(RpcError::Cancelled)));

    // A second call on the same prefetch-1 channel proves the first
    // delivery was acknowledged.
    let status: OrderStatus = client.call_as("orders", 7, OrderQuery { id: 5 }).await?;
    assert_eq!(status.status, "ok");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn failure_without_reply_to_is_dead_lettered() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let server =
        RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(orders_registry());
    server.start().await?;

    let mut exceptions = bus.consume(&config.exceptions_queue(), true).await?;

    // A delivery with no correlation id or reply-to whose handler fails.
    let envelope = Envelope::new(Code::from(13), json!({"id": 1}));
    bus.publish("", "orders", Properties::none(), envelope.encode()?)
        .await?;

    let dead = timeout(Duration::from_millis(200), exceptions.inbox.recv())
        .await
        .expect("nothing reached the exceptions queue")
        .expect("exceptions consumer closed");

    let dead_envelope = Envelope::decode(&dead.payload)?;
    assert!(dead_envelope.error);
    assert_eq!(dead_envelope.code, Code::Num(13));
    assert!(dead_envelope.failure_text().contains("boom"));

    // Exactly one message: nothing else follows.
    let more = timeout(Duration::from_millis(50), exceptions.inbox.recv()).await;
    assert!(more.is_err(), "more than one message dead-lettered");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn undecodable_delivery_is_dead_lettered_and_loop_survives() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let server =
        RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(orders_registry());
    server.start().await?;

    let mut exceptions = bus.consume(&config.exceptions_queue(), true).await?;

    bus.publish(
        "",
        "orders",
        Properties::none(),
        bytes::Bytes::from_static(b"not json"),
    )
    .await?;

    let dead = timeout(Duration::from_millis(200), exceptions.inbox.recv())
        .await
        .expect("garbage was not dead-lettered")
        .expect("exceptions consumer closed");

    let dead_envelope = Envelope::decode(&dead.payload)?;
    assert!(dead_envelope.error);

    // The loop keeps serving.
    let client = RpcClient::with_bus(bus, &config).await?;
    let status: OrderStatus = client.call_as("orders", 7, OrderQuery { id: 5 }).await?;
    assert_eq!(status.status, "ok");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn events_fan_out_across_registries() -> Result<()> {
    // ---
    // Arrange: two event registries bound to code 42, plus a callback on
    // code 43 that must stay silent.
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let (tx_other, mut rx_other) = mpsc::unbounded_channel();

    let billing = Arc::new(EventRegistry::new());
    billing.on(42, move |envelope: Envelope| {
        let _ = tx_a.send(envelope);
    });

    let shipping = Arc::new(EventRegistry::new());
    shipping.on(42, move |envelope: Envelope| {
        let _ = tx_b.send(envelope);
    });
    shipping.on(43, move |envelope: Envelope| {
        let _ = tx_other.send(envelope);
    });

    let server = RpcServer::with_bus(bus.clone(), config.clone())
        .with_event_registry(billing)
        .with_event_registry(shipping);
    server.start().await?;

    let client = RpcClient::with_bus(bus, &config).await?;

    // ---
    // Act
    // ---
    client.publish(42, json!({"x": 1})).await?;

    // ---
    // Assert: both code-42 callbacks fire exactly once with the payload.
    // ---
    for rx in [&mut rx_a, &mut rx_b] {
        let event = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("event callback was not invoked")
            .expect("callback channel closed");

        assert_eq!(event.code, Code::Num(42));
        assert_eq!(event.body, json!({"x": 1}));

        let again = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(again.is_err(), "callback fired more than once");
    }

    let other = timeout(Duration::from_millis(50), rx_other.recv()).await;
    assert!(other.is_err(), "code-43 callback fired for a code-42 event");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn cancellation_wins_over_slow_reply() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let server =
        RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(orders_registry());
    server.start().await?;

    let client = RpcClient::with_bus(bus, &config).await?;

    // Code 21 replies after 200ms; cancel long before that.
    let cancel = CancellationToken::new();
    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client
                .call_with_cancel("orders", 21, OrderQuery { id: 5 }, cancel)
                .await
        })
    };

    sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let settled = call.await.expect("call task panicked");
    assert!(matches!(settled, Err(RpcError::Cancelled)));

    // Let the late reply arrive; it must be dropped without disturbing
    // anything, and the client must still work.
    sleep(Duration::from_millis(300)).await;

    let status: OrderStatus = client.call_as("orders", 7, OrderQuery { id: 5 }).await?;
    assert_eq!(status.status, "ok");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_calls_settle_independently() -> Result<()> {
    // ---
    let bus = create_memory_bus();
    let config = orders_config();

    let registry = Arc::new(RequestRegistry::new());
    registry.on_request(7, |req: OrderQuery| async move {
        // ---
        Ok(Some(OrderStatus {
            status: format!("order-{}", req.id),
        }))
    });

    let server = RpcServer::with_bus(bus.clone(), config.clone()).with_request_registry(registry);
    server.start().await?;

    let client = RpcClient::with_bus(bus, &config).await?;

    let mut handles = Vec::new();
    for i in 0..10 {
        // ---
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let status: OrderStatus = client.call_as("orders", 7, OrderQuery { id: i }).await?;
            Ok::<_, RpcError>((i, status))
        }));
    }

    for handle in handles {
        let (i, status) = handle.await.expect("call task panicked")?;
        assert_eq!(status.status, format!("order-{i}"));
    }

    server.stop().await?;
    Ok(())
}
