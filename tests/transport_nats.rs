// tests/transport_nats.rs
//
// Needs a running server:
// NATS_SERVERS=nats://localhost:4222 cargo test --features transport_nats --test transport_nats -- --ignored

#![cfg(feature = "transport_nats")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use nats_service::{
    // ---
    create_nats_transport,
    ClosedCallback,
    Message,
    RpcError,
    TransportConfig,
};

const WAIT: Duration = Duration::from_secs(2);

fn config(node_id: &str) -> TransportConfig {
    // ---
    let servers = std::env::var("NATS_SERVERS").unwrap_or_else(|_| "nats://localhost:4222".into());
    TransportConfig {
        servers: servers.split(',').map(str::to_string).collect(),
        token: std::env::var("NATS_TOKEN").ok(),
        node_id: node_id.into(),
        transport_type: Some("nats".into()),
        memory_hub: None,
    }
}

fn noop() -> ClosedCallback {
    Arc::new(|| {})
}

#[tokio::test]
#[ignore = "needs a NATS server"]
async fn nats_close_delivers_buffered_publishes() {
    // ---
    let subject = format!("drain.{}", uuid::Uuid::new_v4());
    let reader = create_nats_transport(config("reader"), noop()).await.unwrap();
    let mut sub = reader.subscribe(&subject, None).await.unwrap();
    reader.flush().await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let on_closed: ClosedCallback = {
        let fired = fired.clone();
        Arc::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let writer = create_nats_transport(config("writer"), on_closed).await.unwrap();
    for n in 0..50u8 {
        writer
            .publish(Message::new(subject.as_str(), Bytes::from(vec![n])))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();
    assert!(!writer.is_connected());

    for n in 0..50u8 {
        let msg = timeout(WAIT, sub.inbox.recv())
            .await
            .expect("delivered after close")
            .expect("inbox open");
        assert_eq!(msg.payload, Bytes::from(vec![n]));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    reader.close().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a NATS server"]
async fn nats_subscription_ended_by_limit_is_forgotten() {
    // ---
    let subject = format!("limit.{}", uuid::Uuid::new_v4());
    let transport = create_nats_transport(config("limit"), noop()).await.unwrap();

    let mut sub = transport.subscribe(&subject, None).await.unwrap();
    transport.unsubscribe(&sub.id, Some(1)).await.unwrap();
    transport
        .publish(Message::new(subject.as_str(), Bytes::from_static(b"once")))
        .await
        .unwrap();

    let first = timeout(WAIT, sub.inbox.recv()).await.expect("first delivery");
    assert!(first.is_some());
    let next = timeout(WAIT, sub.inbox.recv()).await.expect("inbox closes");
    assert!(next.is_none());

    let err = transport.unsubscribe(&sub.id, None).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)));

    transport.close().await.unwrap();
}
