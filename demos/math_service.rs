//! Math service with validated actions.
//!
//! Reads its connection settings from the environment (`NATS_SERVERS`,
//! `NATS_TOKEN`, `NATS_TRANSPORT`, ...). Without the `transport_nats`
//! feature, or with `NATS_TRANSPORT=memory`, everything runs in-process.
//!
//! Run with:
//!   cargo run --example math_service
//!   NATS_SERVERS=nats://localhost:4222 cargo run --features transport_nats --example math_service

#![allow(clippy::unwrap_used, clippy::expect_used)]

use nats_service::{ActionSchema, BoxError, Broker, BrokerConfig, CallContext, Result, ServiceRegistrar};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DivRequest {
    numerator: f64,
    #[serde(default = "one")]
    denominator: f64,
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Serialize, Deserialize)]
struct Answer {
    value: f64,
}

fn actions() -> Result<Vec<ActionSchema>> {
    // ---
    let add = ActionSchema::new("add", |ctx: CallContext| async move {
        let req: AddRequest = ctx.payload_as()?;
        Ok::<_, BoxError>(Answer {
            value: (req.a + req.b) as f64,
        })
    })?
    .validate_as::<AddRequest>();

    let div = ActionSchema::new("div", |ctx: CallContext| async move {
        let req: DivRequest = ctx.payload_as()?;
        if req.denominator == 0.0 {
            return Err::<Answer, BoxError>("division by zero".into());
        }
        Ok(Answer {
            value: req.numerator / req.denominator,
        })
    })?
    .validate_as::<DivRequest>();

    // Broadcast: every worker sees every ping.
    let ping = ActionSchema::new("ping", |_ctx: CallContext| async move {
        Ok::<_, BoxError>("pong")
    })?
    .queue(false);

    Ok(vec![add, div, ping])
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let config = BrokerConfig::from_env()?.with_node_id("math-demo");
    let broker = Broker::from_config(config)?;
    broker.connect().await?;

    let mut service = ServiceRegistrar::new("1", "math", 2)?;
    service.add(actions()?);
    service.register(&broker).await?;

    let sum: Answer = broker.request_to("v1.math.add", &json!({"a": 20, "b": 3})).await?;
    println!("20 + 3 = {}", sum.value);

    let half: Answer = broker
        .request_to("v1.math.div", &json!({"numerator": 1.0, "denominator": 2.0}))
        .await?;
    println!("1 / 2 = {}", half.value);

    match broker.call("v1.math.div", &json!({"numerator": 1.0, "denominator": 0.0})).await {
        Ok(envelope) => println!("unexpected success: {envelope:?}"),
        Err(err) => println!("1 / 0 failed: {err}"),
    }

    match broker.call("v1.math.add", &json!({"a": 1})).await {
        Ok(envelope) => println!("unexpected success: {envelope:?}"),
        Err(err) => println!("invalid add rejected: {err}"),
    }

    broker.close().await
}
