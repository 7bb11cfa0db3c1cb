//! Service facade over a NATS-style message broker.
//!
//! This library wraps a publish/subscribe broker connection with a JSON
//! request/reply convention and a small service model:
//!
//! - [`Broker`] connects, publishes, subscribes and sends requests whose
//!   replies use the `{"ok": .., "result" | "message": ..}` envelope.
//! - [`ActionSchema`] describes one request handler, optionally with a
//!   payload validator.
//! - [`ServiceRegistrar`] (or [`Broker::create_service`]) binds actions on
//!   versioned subjects `v{version}.{service}.{action}` with one
//!   subscription per worker.
//!
//! Transports are pluggable. The in-memory transport is always available;
//! the NATS transport is enabled with the `transport_nats` feature.
//!

// Import all sub modules once...
mod macros;

mod action;
mod broker;
mod broker_builder;
mod codec;
mod config;
mod context;
mod dispatch;
mod domain;
mod error;
mod service;
mod subject;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use action::ActionSchema;
pub use broker::{Broker, ClosedSignal, PublishOptions, SubscribeOptions, Subscription};
pub use broker_builder::BrokerBuilder;
pub use config::{BrokerConfig, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER};
pub use context::{CallContext, Emitter};
pub use error::{BoxError, Result, RpcError};
pub use service::{Actions, ServiceRegistrar};
pub use subject::{queue_group, service_subject};

pub use codec::{decode, decode_value, encode, Decoder, ReplyEnvelope};

pub use transport::{
    //
    create_memory_transport,
    create_nats_transport,
    create_transport,
    MemoryHub,
    SubscriptionInfo,
};

// --- public re-exports
pub use domain::{
    //
    ClosedCallback,
    Headers,
    Message,
    SubscriptionHandle,
    SubscriptionId,
    Transport,
    TransportConfig,
    TransportPtr,
};
