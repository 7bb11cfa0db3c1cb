//! Broker connection facade.
//!
//! [`Broker`] owns at most one live transport session and exposes the
//! request/reply, publish and subscribe operations on top of it. Every
//! operation that touches the wire requires a connected session and fails
//! with [`RpcError::NotConnected`] otherwise.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::dispatch::{
    // ---
    spawn_receive_loop,
    ActionDispatcher,
    BoxFuture,
    CallbackConsumer,
    SubscriptionHandler,
};
use crate::transport::{create_transport, MemoryHub};
use crate::{
    // ---
    codec,
    log_debug,
    log_error,
    log_info,
    log_warn,
    subject,
    ActionSchema,
    BoxError,
    BrokerBuilder,
    BrokerConfig,
    CallContext,
    ClosedCallback,
    Decoder,
    Emitter,
    Headers,
    Message,
    ReplyEnvelope,
    Result,
    RpcError,
    SubscriptionId,
    TransportConfig,
    TransportPtr,
};

/// Options for [`Broker::publish`].
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    // ---
    /// Reply address to attach to the message.
    pub reply: Option<String>,

    /// Headers to attach to the message.
    pub headers: Option<Headers>,

    /// Flush the connection after publishing.
    pub flush: bool,
}

impl PublishOptions {
    /// Attach a reply address.
    pub fn reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Attach headers.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Flush after publishing.
    pub fn flush(mut self) -> Self {
        self.flush = true;
        self
    }
}

/// Options for [`Broker::subscribe`].
///
/// By default payloads are decoded as JSON and no queue group is joined.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    // ---
    /// Queue group to join.
    pub queue: Option<String>,

    /// Payload decoder. `None` hands the raw message to the callback.
    pub decoder: Option<Decoder>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            decoder: Some(Decoder::json()),
        }
    }
}

impl SubscribeOptions {
    /// Join queue group `queue`.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Use a custom decoder.
    pub fn decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Skip decoding; the callback reads `ctx.message` directly.
    pub fn raw(mut self) -> Self {
        self.decoder = None;
        self
    }
}

/// A live subscription created by [`Broker::subscribe`] or
/// [`Broker::create_service`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    // ---
    id: SubscriptionId,
    subject: Arc<str>,
    queue: Option<Arc<str>>,
}

impl Subscription {
    /// Transport-level identifier.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Subscribed subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue group, if any.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }
}

/// One-shot, resettable closed latch.
///
/// Setting an already set latch is a no-op. Waiters are released the first
/// time the latch is set after a reset.
#[derive(Debug)]
pub struct ClosedSignal {
    tx: watch::Sender<bool>,
}

impl Default for ClosedSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ClosedSignal {
    // ---
    /// Create an unset latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Set the latch. Returns `true` if this call changed it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Clear the latch for a new session.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Whether the latch is set.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is set.
    pub async fn wait(&self) {
        // ---
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Broker connection.
///
/// Cheap to clone; clones share the same session. Built disconnected by
/// [`BrokerBuilder`]; call [`connect`](Self::connect) before use.
///
/// ```
/// # async fn example() -> nats_service::Result<()> {
/// use nats_service::{BoxError, Broker, MemoryHub};
/// use serde_json::json;
///
/// let broker = Broker::builder().memory_hub(MemoryHub::new()).build()?;
/// broker.connect().await?;
///
/// broker
///     .subscribe("greet", |ctx| async move {
///         println!("got {}", ctx.payload());
///         Ok::<_, BoxError>(())
///     }, Default::default())
///     .await?;
/// broker.publish("greet", &json!({"hi": 1}), Default::default()).await?;
/// broker.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    config: BrokerConfig,
    memory_hub: Option<Arc<MemoryHub>>,
    session: RwLock<Option<Session>>,
    closed: Arc<ClosedSignal>,

    // Serializes connect/close so a session is never replaced mid-close.
    lifecycle: Mutex<()>,
}

/// One live transport session.
///
/// `id` is unique across every broker in the process, so anything bound on
/// a session can tell when that session has been replaced.
#[derive(Clone)]
struct Session {
    id: u64,
    transport: TransportPtr,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn read_ignore_poison<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_ignore_poison<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Broker {
    // ---
    /// Start building a broker.
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Build a disconnected broker from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingConfig`] when `config.servers` is empty.
    pub fn from_config(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config, None))
    }

    pub(crate) fn new(config: BrokerConfig, memory_hub: Option<Arc<MemoryHub>>) -> Self {
        // ---
        let closed = Arc::new(ClosedSignal::new());
        // No session yet counts as closed.
        closed.set();

        Self {
            inner: Arc::new(Inner {
                config,
                memory_hub,
                session: RwLock::new(None),
                closed,
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Node id attached to every log line of this broker.
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Open a session with the configured servers.
    ///
    /// A previous session, if any, is closed first. The closed signal is
    /// reset and will fire once when the new session ends.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionFailed`] when no server accepts the
    /// connection. The failure is logged before it is returned.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;

        let previous = write_ignore_poison(&self.inner.session).take();
        if let Some(previous) = previous {
            log_debug!(node = self.node_id(), "replacing session {}", previous.id);
            if let Err(err) = previous.transport.close().await {
                log_warn!(node = self.node_id(), "closing previous session failed: {err}");
            }
        }

        self.inner.closed.reset();

        let config = &self.inner.config;
        let transport_config = TransportConfig {
            servers: config.servers.clone(),
            token: config.token.clone(),
            node_id: config.node_id.clone(),
            transport_type: config.transport_type.clone(),
            memory_hub: self.inner.memory_hub.clone(),
        };

        let signal = self.inner.closed.clone();
        let node_id = config.node_id.clone();
        let on_closed: ClosedCallback = Arc::new(move || {
            if signal.set() {
                log_info!(node = node_id, "connection closed");
            }
        });

        match create_transport(transport_config, on_closed).await {
            Ok(transport) => {
                log_info!(
                    node = self.node_id(),
                    "connected to {}",
                    config.servers.join(",")
                );
                let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
                *write_ignore_poison(&self.inner.session) = Some(Session { id, transport });
                Ok(())
            }
            Err(err) => {
                log_error!(
                    node = self.node_id(),
                    "failed to connect to {}: {err}",
                    config.servers.join(",")
                );
                self.inner.closed.set();
                Err(err)
            }
        }
    }

    /// Close the current session.
    ///
    /// Closing a broker without a session is a no-op.
    pub async fn close(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;

        let session = write_ignore_poison(&self.inner.session).take();
        match session {
            Some(session) => {
                let result = session.transport.close().await;
                // Transports fire the callback themselves; this covers one
                // that failed before it could.
                self.inner.closed.set();
                result
            }
            None => Ok(()),
        }
    }

    /// Wait until the current session is closed.
    pub async fn closed(&self) {
        self.inner.closed.wait().await;
    }

    /// Whether the closed signal is set.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_set()
    }

    /// Whether a usable session exists.
    pub fn is_connected(&self) -> bool {
        read_ignore_poison(&self.inner.session)
            .as_ref()
            .is_some_and(|session| session.transport.is_connected())
    }

    fn require_session(&self) -> Result<Session> {
        // ---
        match read_ignore_poison(&self.inner.session).as_ref() {
            Some(session) if session.transport.is_connected() => Ok(session.clone()),
            _ => Err(RpcError::NotConnected),
        }
    }

    pub(crate) fn require_transport(&self) -> Result<TransportPtr> {
        self.require_session().map(|session| session.transport)
    }

    /// Identifier of the live session.
    ///
    /// Changes on every successful [`connect`](Self::connect) and differs
    /// between brokers.
    pub(crate) fn session_id(&self) -> Result<u64> {
        self.require_session().map(|session| session.id)
    }

    /// Send a request to `topic` and wait up to `timeout` for the reply
    /// envelope.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NotConnected`] without a session
    /// - [`RpcError::Timeout`] when no reply arrives in time
    /// - [`RpcError::Remote`] carrying the remote message when the reply has
    ///   `ok == false`
    /// - [`RpcError::Decode`] when the reply is not an envelope
    pub async fn request<T>(&self, topic: &str, payload: &T, timeout: Duration) -> Result<ReplyEnvelope>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let transport = self.require_transport()?;
        let bytes = codec::encode(payload)?;

        let reply = transport.request(topic, bytes, timeout).await?;
        let envelope: ReplyEnvelope = codec::decode(&reply.payload)?;

        if !envelope.ok {
            let message = envelope.message.unwrap_or_default();
            log_debug!(node = self.node_id(), "request to {topic} failed remotely: {message}");
            return Err(RpcError::Remote(message));
        }
        Ok(envelope)
    }

    /// [`request`](Self::request) with the configured default timeout.
    pub async fn call<T>(&self, topic: &str, payload: &T) -> Result<ReplyEnvelope>
    where
        T: Serialize + ?Sized,
    {
        self.request(topic, payload, self.inner.config.request_timeout)
            .await
    }

    /// Send a request and deserialize the successful `result` into `TResp`.
    ///
    /// A missing `result` deserializes from `null`.
    pub async fn request_to<TReq, TResp>(&self, topic: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        // ---
        let envelope = self.call(topic, req).await?;
        let result = envelope.into_result()?;
        serde_json::from_value(result).map_err(|err| RpcError::Decode(err.to_string()))
    }

    /// Request capability bound to this broker.
    pub fn emit(&self) -> Emitter {
        Emitter::new(self.clone())
    }

    /// Publish `payload` on `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotConnected`] without a session.
    pub async fn publish<T>(&self, subject: &str, payload: &T, opts: PublishOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let transport = self.require_transport()?;

        let mut msg = Message::new(subject, codec::encode(payload)?);
        if let Some(reply) = opts.reply {
            msg = msg.with_reply(reply);
        }
        if let Some(headers) = opts.headers {
            msg = msg.with_headers(headers);
        }

        transport.publish(msg).await?;
        if opts.flush {
            transport.flush().await?;
        }
        Ok(())
    }

    /// Send a reply envelope to `reply`.
    pub(crate) async fn respond(&self, reply: &str, envelope: &ReplyEnvelope) -> Result<()> {
        // ---
        let transport = self.require_transport()?;
        transport
            .publish(Message::new(reply, codec::encode(envelope)?))
            .await
    }

    /// Subscribe `handler` to `subject`.
    ///
    /// Every delivery runs the handler in its own task with a
    /// [`CallContext`]. Handler errors and panics are logged and do not end
    /// the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotConnected`] without a session.
    pub async fn subscribe<F, Fut, E>(
        &self,
        subject: &str,
        handler: F,
        opts: SubscribeOptions,
    ) -> Result<Subscription>
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        // ---
        let transport = self.require_transport()?;

        let handler: SubscriptionHandler = Arc::new(
            move |ctx: CallContext| -> BoxFuture<'static, std::result::Result<(), BoxError>> {
                let fut = handler(ctx);
                Box::pin(async move {
                    match fut.await {
                        Ok(()) => Ok(()),
                        Err(err) => Err(err.into()),
                    }
                })
            },
        );

        let handle = transport.subscribe(subject, opts.queue.as_deref()).await?;
        let consumer = CallbackConsumer::new(self.clone(), opts.decoder, handler);
        spawn_receive_loop(
            self.node_id().to_string(),
            subject.to_string(),
            handle.inbox,
            Arc::new(consumer),
        );

        log_debug!(node = self.node_id(), "subscribed to {subject}");

        Ok(Subscription {
            id: handle.id,
            subject: Arc::from(subject),
            queue: opts.queue.map(Arc::from),
        })
    }

    /// Cancel `subscription`, immediately or after `max_msgs` further
    /// deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotConnected`] without a session.
    pub async fn unsubscribe(&self, subscription: &Subscription, max_msgs: Option<u64>) -> Result<()> {
        // ---
        let transport = self.require_transport()?;
        transport.unsubscribe(&subscription.id, max_msgs).await
    }

    /// Register `actions` as service `name` at `version` with `workers`
    /// subscriptions per action.
    ///
    /// Each action is bound on `v{version}.{name}.{action}`. Queued actions
    /// put worker `i` in queue group `{subject}-{i}`; unqueued actions
    /// subscribe without a group. Calling this twice binds everything twice.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NotConnected`] without a session
    /// - [`RpcError::InvalidConfig`] when `workers` is zero
    pub async fn create_service(
        &self,
        version: &str,
        name: &str,
        workers: usize,
        actions: &[ActionSchema],
    ) -> Result<Vec<Subscription>> {
        // ---
        self.require_transport()?;
        if workers == 0 {
            return Err(RpcError::InvalidConfig("workers must be at least 1".into()));
        }

        let mut subscriptions = Vec::with_capacity(actions.len() * workers);
        for action in actions {
            for worker in 0..workers {
                subscriptions.push(self.bind_action(version, name, action, worker).await?);
            }
        }
        Ok(subscriptions)
    }

    /// Bind one worker subscription of `action`.
    pub(crate) async fn bind_action(
        &self,
        version: &str,
        name: &str,
        action: &ActionSchema,
        worker: usize,
    ) -> Result<Subscription> {
        // ---
        let transport = self.require_transport()?;

        let subject = subject::service_subject(version, name, action.name());
        let queue = action
            .is_queued()
            .then(|| subject::queue_group(&subject, worker));

        let handle = transport.subscribe(&subject, queue.as_deref()).await?;
        let dispatcher = ActionDispatcher::new(self.clone(), action.clone());
        spawn_receive_loop(
            self.node_id().to_string(),
            subject.clone(),
            handle.inbox,
            Arc::new(dispatcher),
        );

        log_info!(
            node = self.node_id(),
            "[{subject}] registered topic (worker {worker}, queue {})",
            queue.as_deref().unwrap_or("none")
        );

        Ok(Subscription {
            id: handle.id,
            subject: Arc::from(subject),
            queue: queue.map(Arc::from),
        })
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Broker")
            .field("node_id", &self.node_id())
            .field("servers", &self.inner.config.servers)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
