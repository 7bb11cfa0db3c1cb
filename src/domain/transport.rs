// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface used by the
//! broker facade to exchange messages. It intentionally avoids any reference
//! to concrete client libraries.
//!
//! The transport layer is responsible only for moving opaque payloads between
//! publishers and subscribers, for request/reply inbox handling, and for
//! queue-group load balancing. Higher-level semantics such as the reply
//! envelope, subject naming and action dispatch are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::MemoryHub;

/// Message headers carried alongside a payload.
pub type Headers = BTreeMap<String, String>;

/// Callback fired by a transport when its session is closed.
///
/// Transports must invoke it at most once per session.
pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// A message as seen on the wire.
///
/// `reply` is present when the sender expects an answer (request/reply);
/// plain publishes carry no reply address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    // ---
    /// Subject the message was published on.
    pub subject: Arc<str>,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Reply address, if the sender awaits a response.
    pub reply: Option<Arc<str>>,

    /// Optional headers.
    pub headers: Option<Headers>,
}

impl Message {
    // ---
    /// Create a message without reply address or headers.
    pub fn new(subject: impl Into<Arc<str>>, payload: Bytes) -> Self {
        // ---
        Self {
            subject: subject.into(),
            payload,
            reply: None,
            headers: None,
        }
    }

    /// Attach a reply address.
    pub fn with_reply(mut self, reply: impl Into<Arc<str>>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Attach headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Identifier of one transport subscription.
///
/// Unique per subscription, cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Arc<str>);

impl SubscriptionId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        SubscriptionId(uuid::Uuid::new_v4().to_string().into())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned from a successful subscription.
///
/// Messages matching the subscription are delivered to `inbox`. The inbox
/// closes once the subscription is cancelled or the transport is closed.
pub struct SubscriptionHandle {
    // ---
    /// Identifier used to unsubscribe.
    pub id: SubscriptionId,

    /// Receiver channel for delivered messages.
    pub inbox: mpsc::Receiver<Message>,
}

/// Configuration for creating a transport instance.
///
/// Passed to transport factory functions (`create_*_transport()`).
#[derive(Clone)]
pub struct TransportConfig {
    /// Broker endpoints, in preference order.
    pub servers: Vec<String>,
    /// Optional authentication token.
    pub token: Option<String>,
    /// Node ID for this transport instance, used for logging.
    pub node_id: String,
    /// Optional transport type override (`"memory"`, `"nats"`).
    /// If `None`, uses feature-flag driven selection.
    pub transport_type: Option<String>,
    /// Explicit in-memory hub; the process-global hub is used when `None`.
    pub memory_hub: Option<Arc<MemoryHub>>,
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("TransportConfig")
            .field("servers", &self.servers)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("node_id", &self.node_id)
            .field("transport_type", &self.transport_type)
            .field("memory_hub", &self.memory_hub.is_some())
            .finish()
    }
}

/// Transport abstraction.
///
/// A `Transport` is one live session with a publish/subscribe substrate.
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point and matching the subscription are deliverable.
/// - Subscribers that share a `(subject, queue)` pair form a queue group;
///   exactly one member of the group receives each message.
/// - Subscribers without a queue each receive every matching message.
/// - `close()` fires the session's [`ClosedCallback`] once.
///
/// All methods are safe to call concurrently; implementations serialize wire
/// access internally.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns the identifier of this transport, used for logging.
    fn transport_id(&self) -> &str;

    /// Whether the session is currently usable.
    fn is_connected(&self) -> bool;

    /// Publish a message. Does not wait for subscribers.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Wait until buffered outbound messages have been written.
    async fn flush(&self) -> Result<()>;

    /// Publish `payload` on `subject` with a fresh reply inbox and wait for
    /// the first reply.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`](crate::RpcError::Timeout) when no reply arrives in time
    /// - [`RpcError::NoResponders`](crate::RpcError::NoResponders) when nothing is subscribed
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message>;

    /// Register a subscription, optionally as a member of queue group `queue`.
    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<SubscriptionHandle>;

    /// Cancel a subscription now, or after `max_msgs` further deliveries.
    async fn unsubscribe(&self, id: &SubscriptionId, max_msgs: Option<u64>) -> Result<()>;

    /// Close the session and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
pub type TransportPtr = Arc<dyn Transport>;
