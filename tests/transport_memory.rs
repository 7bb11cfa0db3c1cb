// tests/transport_memory.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use nats_service::{
    // ---
    create_memory_transport,
    create_transport,
    ClosedCallback,
    MemoryHub,
    Message,
    RpcError,
    TransportConfig,
};

const WAIT: Duration = Duration::from_secs(1);

fn config(hub: &Arc<MemoryHub>, node_id: &str) -> TransportConfig {
    // ---
    TransportConfig {
        servers: vec!["memory://".into()],
        token: None,
        node_id: node_id.into(),
        transport_type: Some("memory".into()),
        memory_hub: Some(hub.clone()),
    }
}

fn noop() -> ClosedCallback {
    Arc::new(|| {})
}

#[tokio::test]
async fn memory_subscribe_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport(config(&hub, "mstpd"), noop())
        .await
        .expect("failed to create memory transport");

    let mut sub = transport
        .subscribe("test.subject", None)
        .await
        .expect("subscribe failed");

    let mut headers = BTreeMap::new();
    headers.insert("trace".to_string(), "abc".to_string());
    let msg = Message::new("test.subject", Bytes::from_static(b"hello"))
        .with_reply("test.reply")
        .with_headers(headers);

    // ---
    // Act
    // ---
    transport.publish(msg.clone()).await.expect("publish failed");

    // ---
    // Assert
    // ---
    let received = timeout(WAIT, sub.inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("inbox closed");
    assert_eq!(received, msg);
}

#[tokio::test]
async fn memory_publish_before_subscribe_is_not_delivered() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport(config(&hub, "late"), noop())
        .await
        .expect("failed to create memory transport");

    transport
        .publish(Message::new("early", Bytes::from_static(b"lost")))
        .await
        .expect("publish failed");

    let mut sub = transport.subscribe("early", None).await.expect("subscribe failed");
    assert!(timeout(Duration::from_millis(50), sub.inbox.recv()).await.is_err());
}

#[tokio::test]
async fn memory_hubs_are_isolated() {
    // ---
    let hub_a = MemoryHub::new();
    let hub_b = MemoryHub::new();
    let a = create_memory_transport(config(&hub_a, "a"), noop()).await.unwrap();
    let b = create_memory_transport(config(&hub_b, "b"), noop()).await.unwrap();

    let mut sub = b.subscribe("shared", None).await.unwrap();
    a.publish(Message::new("shared", Bytes::new())).await.unwrap();

    assert!(timeout(Duration::from_millis(50), sub.inbox.recv()).await.is_err());
}

#[tokio::test]
async fn memory_request_reply_roundtrip() {
    // ---
    let hub = MemoryHub::new();
    let server = create_memory_transport(config(&hub, "server"), noop()).await.unwrap();
    let client = create_memory_transport(config(&hub, "client"), noop()).await.unwrap();

    let mut sub = server.subscribe("svc.ping", None).await.unwrap();
    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            let req = sub.inbox.recv().await.expect("request");
            let reply = req.reply.expect("reply address");
            assert!(reply.starts_with("_INBOX."));
            server
                .publish(Message::new(reply, Bytes::from_static(b"pong")))
                .await
                .unwrap();
        })
    };

    let reply = client
        .request("svc.ping", Bytes::from_static(b"ping"), WAIT)
        .await
        .expect("request failed");
    assert_eq!(reply.payload, Bytes::from_static(b"pong"));
    responder.await.unwrap();

    // The reply inbox is gone once the request completes.
    let live = hub.subscriptions().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].subject, "svc.ping");
}

#[tokio::test]
async fn memory_request_times_out_without_reply() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport(config(&hub, "mute"), noop()).await.unwrap();
    let _sub = transport.subscribe("svc.mute", None).await.unwrap();

    let err = transport
        .request("svc.mute", Bytes::new(), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));
}

#[tokio::test]
async fn memory_unsubscribe_stops_delivery() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport(config(&hub, "unsub"), noop()).await.unwrap();

    let mut sub = transport.subscribe("topic", None).await.unwrap();
    transport.unsubscribe(&sub.id, None).await.unwrap();
    transport
        .publish(Message::new("topic", Bytes::new()))
        .await
        .unwrap();

    // The hub dropped its sender, so the inbox reports closed.
    let next = timeout(WAIT, sub.inbox.recv()).await.expect("inbox closes");
    assert!(next.is_none());
}

#[tokio::test]
async fn memory_close_fires_callback_and_rejects_use() {
    // ---
    let hub = MemoryHub::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let on_closed: ClosedCallback = {
        let fired = fired.clone();
        Arc::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };

    let transport = create_memory_transport(config(&hub, "closing"), on_closed)
        .await
        .unwrap();
    assert!(transport.is_connected());

    transport.close().await.unwrap();
    transport.close().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!transport.is_connected());

    let err = transport
        .publish(Message::new("x", Bytes::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotConnected));
}

#[tokio::test]
async fn create_transport_rejects_unknown_type() {
    // ---
    let hub = MemoryHub::new();
    let mut cfg = config(&hub, "bogus");
    cfg.transport_type = Some("carrier-pigeon".into());

    let err = match create_transport(cfg, noop()).await {
        Ok(_) => panic!("unknown transport type accepted"),
        Err(err) => err,
    };
    assert!(matches!(err, RpcError::InvalidConfig(_)));
}

#[tokio::test]
async fn create_transport_uses_memory_for_explicit_hub() {
    // ---
    let hub = MemoryHub::new();
    let mut cfg = config(&hub, "auto");
    cfg.transport_type = None;

    let transport = create_transport(cfg, noop()).await.expect("memory transport");
    let _sub = transport.subscribe("auto", Some("q")).await.unwrap();

    let live = hub.subscriptions().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].queue.as_deref(), Some("q"));
}
