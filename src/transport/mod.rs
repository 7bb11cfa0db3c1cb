//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. All transports are exposed only through constructor
//! functions; broker-backed ones are hidden behind feature flags.
//!
//! Domain code must not depend on transport-specific types.

mod memory;
mod nats;

pub use memory::{
    //
    create_memory_transport,
    MemoryHub,
    SubscriptionInfo,
};

pub use nats::create_nats_transport;

use crate::{ClosedCallback, Result, RpcError, TransportConfig, TransportPtr};

/// Create a transport for `config`.
///
/// When `config.transport_type` is set it selects the factory directly.
/// Otherwise the NATS transport is used when compiled in, and the in-memory
/// transport is the unconditional fallback.
pub async fn create_transport(
    config: TransportConfig,
    on_closed: ClosedCallback,
) -> Result<TransportPtr> {
    // ---
    match config.transport_type.as_deref() {
        Some("nats") => create_nats_transport(config, on_closed).await,
        Some("memory") => create_memory_transport(config, on_closed).await,
        Some(other) => Err(RpcError::InvalidConfig(format!(
            "unrecognized transport_type: {other}, valid values: memory, nats"
        ))),
        None if config.memory_hub.is_some() => create_memory_transport(config, on_closed).await,
        None => {
            if cfg!(feature = "transport_nats") {
                create_nats_transport(config, on_closed).await
            } else {
                create_memory_transport(config, on_closed).await
            }
        }
    }
}
