//! Per-invocation call context handed to action handlers and pub/sub
//! callbacks.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{
    // ---
    Broker,
    Message,
    ReplyEnvelope,
    Result,
    RpcError,
};

/// Bound request capability.
///
/// Lets handler code issue further requests through the broker that
/// delivered the current message.
#[derive(Clone)]
pub struct Emitter {
    broker: Broker,
}

impl Emitter {
    // ---
    pub(crate) fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Request `topic` using the broker's default request timeout.
    pub async fn emit<T>(&self, topic: &str, payload: &T) -> Result<ReplyEnvelope>
    where
        T: Serialize + ?Sized,
    {
        self.broker.call(topic, payload).await
    }

    /// Request `topic` with an explicit timeout.
    pub async fn emit_with_timeout<T>(
        &self,
        topic: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<ReplyEnvelope>
    where
        T: Serialize + ?Sized,
    {
        self.broker.request(topic, payload, timeout).await
    }
}

/// Context of one handler invocation.
///
/// Built fresh for every inbound message. `message` and `payload` are set
/// when the context was derived from a delivery; `payload` holds the decoded
/// (and, for actions with a validator, normalized) value.
#[derive(Clone)]
pub struct CallContext {
    // ---
    /// Broker that delivered the message.
    pub broker: Broker,

    /// Request capability bound to `broker`.
    pub emit: Emitter,

    /// Raw inbound message.
    pub message: Option<Message>,

    /// Decoded payload. `None` for raw-byte subscriptions.
    pub payload: Option<Value>,
}

impl CallContext {
    // ---
    /// Context carrying only broker access.
    pub fn new(broker: Broker) -> Self {
        // ---
        let emit = Emitter::new(broker.clone());
        Self {
            broker,
            emit,
            message: None,
            payload: None,
        }
    }

    /// Context derived from an inbound message.
    pub fn from_message(broker: Broker, message: Message, payload: Option<Value>) -> Self {
        // ---
        let mut ctx = Self::new(broker);
        ctx.message = Some(message);
        ctx.payload = payload;
        ctx
    }

    /// Decoded payload, or `null` when none was decoded.
    pub fn payload(&self) -> &Value {
        self.payload.as_ref().unwrap_or(&Value::Null)
    }

    /// Deserialize the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Decode`] when the payload does not match `T`.
    pub fn payload_as<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.payload().clone()).map_err(|err| RpcError::Decode(err.to_string()))
    }

    /// Reply address of the inbound message, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.message.as_ref().and_then(|msg| msg.reply.as_deref())
    }

    /// Subject of the inbound message, if any.
    pub fn subject(&self) -> Option<&str> {
        self.message.as_ref().map(|msg| msg.subject.as_ref())
    }
}
