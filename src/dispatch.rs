//! Inbound message dispatch.
//!
//! This module is the glue between a transport subscription and user code.
//! [`spawn_receive_loop`] drives one subscription inbox and hands every
//! message to a [`MessageConsumer`] in its own task, so a slow or failing
//! handler never blocks later deliveries.
//!
//! Two consumers exist:
//!
//! - [`ActionDispatcher`] runs one [`ActionSchema`] through
//!   `Decode -> Validate -> Invoke -> Respond` and frames the outcome in a
//!   [`ReplyEnvelope`] when the message carries a reply address.
//! - [`CallbackConsumer`] backs plain pub/sub subscriptions: it decodes the
//!   payload (or leaves it raw) and calls the subscriber's callback.
//!
//! Failures at any step are logged with the subject and the action name.
//! They terminate only the message being processed; the receive loop keeps
//! serving the subscription.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    // ---
    codec,
    log_debug,
    log_error,
    log_warn,
    ActionSchema,
    BoxError,
    Broker,
    CallContext,
    Decoder,
    Message,
    ReplyEnvelope,
    RpcError,
};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased pub/sub callback.
pub(crate) type SubscriptionHandler =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

/// A consumer of messages delivered to one subscription.
///
/// Implementations must not assume mutual exclusion: several messages of the
/// same subscription may be handled concurrently.
#[async_trait::async_trait]
pub(crate) trait MessageConsumer: Send + Sync {
    /// Handle a single inbound message. Failures are handled internally.
    async fn handle_message(&self, msg: Message);
}

/// Start the receive loop for one subscription inbox.
///
/// The loop ends when the inbox closes, which happens when the subscription
/// is cancelled or the transport is closed. In-flight handler tasks are not
/// cancelled.
pub(crate) fn spawn_receive_loop<C>(
    node_id: String,
    subject: String,
    mut inbox: mpsc::Receiver<Message>,
    consumer: Arc<C>,
) -> JoinHandle<()>
where
    C: MessageConsumer + 'static,
{
    // ---
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                consumer.handle_message(msg).await;
            });
        }
        log_debug!(node = node_id, "receive loop for {subject} stopped");
    })
}

/// Runs one action for every message on its canonical subject.
pub(crate) struct ActionDispatcher {
    // ---
    broker: Broker,
    action: ActionSchema,
}

impl ActionDispatcher {
    // ---
    pub(crate) fn new(broker: Broker, action: ActionSchema) -> Self {
        Self { broker, action }
    }

    /// Decode, validate and invoke. The error's display text is what the
    /// caller sees in the failure envelope.
    async fn run(&self, msg: Message) -> Result<Value, RpcError> {
        // ---
        let payload = codec::decode_value(&msg.payload)?;

        let payload = self
            .action
            .normalize(payload)
            .map_err(|err| RpcError::Validation(err.to_string()))?;

        let ctx = CallContext::from_message(self.broker.clone(), msg, Some(payload));

        match AssertUnwindSafe(self.action.invoke(ctx)).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(RpcError::Handler(err.to_string())),
            Err(_panic) => Err(RpcError::Handler(format!(
                "handler for {} panicked",
                self.action.name()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl MessageConsumer for ActionDispatcher {
    async fn handle_message(&self, msg: Message) {
        // ---
        let subject = msg.subject.clone();
        let reply = msg.reply.clone();

        let envelope = match self.run(msg).await {
            Ok(result) => ReplyEnvelope::success(result),
            Err(err) => {
                log_error!(
                    node = self.broker.node_id(),
                    "handler for {} on {subject} failed: {err} ({err:?})",
                    self.action.name()
                );
                ReplyEnvelope::failure(err.to_string())
            }
        };

        let Some(reply) = reply else {
            // Fire-and-forget publish: nobody is waiting for the outcome.
            return;
        };

        if let Err(err) = self.broker.respond(&reply, &envelope).await {
            log_error!(
                node = self.broker.node_id(),
                "failed to reply to {reply} for {}: {err}",
                self.action.name()
            );
        }
    }
}

/// Backs a plain pub/sub subscription.
pub(crate) struct CallbackConsumer {
    // ---
    broker: Broker,
    decoder: Option<Decoder>,
    handler: SubscriptionHandler,
}

impl CallbackConsumer {
    pub(crate) fn new(broker: Broker, decoder: Option<Decoder>, handler: SubscriptionHandler) -> Self {
        Self {
            broker,
            decoder,
            handler,
        }
    }
}

#[async_trait::async_trait]
impl MessageConsumer for CallbackConsumer {
    async fn handle_message(&self, msg: Message) {
        // ---
        let subject = msg.subject.clone();

        let payload = match &self.decoder {
            None => None,
            Some(decoder) => match decoder.decode(&msg.payload) {
                Ok(value) => Some(value),
                Err(err) => {
                    log_warn!(
                        node = self.broker.node_id(),
                        "dropping undecodable message on {subject}: {err}"
                    );
                    return;
                }
            },
        };

        let ctx = CallContext::from_message(self.broker.clone(), msg, payload);

        match AssertUnwindSafe((self.handler)(ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log_error!(
                    node = self.broker.node_id(),
                    "subscriber callback on {subject} failed: {err}"
                );
            }
            Err(_panic) => {
                log_error!(
                    node = self.broker.node_id(),
                    "subscriber callback on {subject} panicked"
                );
            }
        }
    }
}
