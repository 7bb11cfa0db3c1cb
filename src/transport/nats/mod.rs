//! NATS transport.
//!
//! Backed by `async-nats` when the `transport_nats` feature is enabled.
//! Without the feature the constructor fails fast, so feature-driven
//! selection can fall through to the in-memory transport.

#[cfg(feature = "transport_nats")]
mod transport;

#[cfg(feature = "transport_nats")]
pub use transport::create_transport as create_nats_transport;

#[cfg(not(feature = "transport_nats"))]
pub async fn create_nats_transport(
    _config: crate::TransportConfig,
    _on_closed: crate::ClosedCallback,
) -> crate::Result<crate::TransportPtr> {
    Err(crate::RpcError::Transport(
        "transport_nats feature is not enabled".into(),
    ))
}
