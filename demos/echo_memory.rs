//! Echo service using the in-memory transport.
//!
//! Registers one action and calls it from the same process. Useful as a
//! smoke test that needs no broker.
//!
//! Run with: RUST_LOG=debug cargo run --example echo_memory

#![allow(clippy::unwrap_used, clippy::expect_used)]

use nats_service::{ActionSchema, BoxError, Broker, CallContext, MemoryHub, Result};
use serde_json::json;
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let broker = Broker::builder()
        .node_id("echo-demo")
        .memory_hub(MemoryHub::new())
        .build()?;
    broker.connect().await?;

    let echo = ActionSchema::new("echo", |ctx: CallContext| async move {
        Ok::<_, BoxError>(ctx.payload().clone())
    })?;
    broker.create_service("1", "demo", 2, &[echo]).await?;

    let envelope = broker.call("v1.demo.echo", &json!({"x": 1})).await?;
    println!("reply: {}", serde_json::to_string(&envelope).expect("envelope serializes"));

    broker.close().await?;
    broker.closed().await;
    Ok(())
}
