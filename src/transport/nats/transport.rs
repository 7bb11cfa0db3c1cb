//! NATS transport implementation using `async-nats`.
//!
//! ## Concurrency model
//!
//! - The `async_nats::Client` is internally synchronized and cheap to clone;
//!   publish, flush and request calls go straight to it.
//! - Each subscription is owned by a dedicated **pump task** that forwards
//!   broker messages into the subscription inbox and listens for control
//!   commands (unsubscribe, unsubscribe-after-n).
//! - Dropping the control sender (on `close()`) makes the pump unsubscribe
//!   and exit.
//! - A pump removes its own registry entry when it exits, whether it was
//!   told to stop, hit its message limit or saw the broker end the
//!   subscription.
//!
//! ## Connection behavior
//!
//! The session is established eagerly by [`create_transport`]. Reconnects are
//! handled by `async-nats` itself; when the client reports `Event::Closed`
//! the broker's closed callback fires. The callback is guarded so that an
//! explicit `close()` and the client event never fire it twice. `close()`
//! drains the client, so buffered publishes reach the server before the
//! connection goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_nats::connection::State;
use async_nats::{Event, HeaderMap, RequestErrorKind, ServerAddr};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    ClosedCallback,
    Headers,
    Message,
    Result,
    RpcError,
    SubscriptionHandle,
    SubscriptionId,
    Transport,
    TransportConfig,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 64;

/// Control commands accepted by a subscription pump.
enum Control {
    Unsubscribe { max_msgs: Option<u64> },
}

/// Fires the closed callback at most once.
struct CloseLatch {
    fired: AtomicBool,
    on_closed: ClosedCallback,
}

impl CloseLatch {
    fn fire(&self) {
        // ---
        if !self.fired.swap(true, Ordering::AcqRel) {
            (self.on_closed)();
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Control senders of the live pumps, keyed by subscription.
#[derive(Clone, Default)]
struct PumpRegistry {
    inner: Arc<Mutex<HashMap<SubscriptionId, mpsc::Sender<Control>>>>,
}

impl PumpRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, mpsc::Sender<Control>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pump; the entry lives as long as the returned guard.
    fn insert(&self, id: SubscriptionId, control: mpsc::Sender<Control>) -> PumpEntry {
        // ---
        self.lock().insert(id.clone(), control);
        PumpEntry {
            registry: self.clone(),
            id,
        }
    }

    fn get(&self, id: &SubscriptionId) -> Option<mpsc::Sender<Control>> {
        self.lock().get(id).cloned()
    }

    fn remove(&self, id: &SubscriptionId) -> Option<mpsc::Sender<Control>> {
        self.lock().remove(id)
    }

    fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Owned by a pump task; drops the registry entry when the pump ends.
struct PumpEntry {
    registry: PumpRegistry,
    id: SubscriptionId,
}

impl Drop for PumpEntry {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// NATS-based implementation of the `Transport` trait.
struct NatsTransport {
    // ---
    transport_id: String,
    client: async_nats::Client,
    pumps: PumpRegistry,
    latch: Arc<CloseLatch>,
}

fn into_message(msg: async_nats::Message) -> Message {
    // ---
    let headers = msg.headers.as_ref().map(|map| {
        let mut headers = Headers::new();
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
        headers
    });

    Message {
        subject: Arc::from(msg.subject.as_str()),
        payload: msg.payload,
        reply: msg.reply.as_ref().map(|reply| Arc::from(reply.as_str())),
        headers,
    }
}

fn into_header_map(headers: &Headers) -> HeaderMap {
    // ---
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

impl NatsTransport {
    fn ensure_connected(&self) -> Result<()> {
        // ---
        if self.is_connected() {
            Ok(())
        } else {
            Err(RpcError::NotConnected)
        }
    }

    /// Forward broker messages into `inbox` until unsubscribed.
    async fn pump(
        transport_id: String,
        entry: PumpEntry,
        mut subscriber: async_nats::Subscriber,
        inbox: mpsc::Sender<Message>,
        mut control: mpsc::Receiver<Control>,
    ) {
        // ---
        let _entry = entry;
        let mut remaining: Option<u64> = None;

        loop {
            tokio::select! {
                cmd = control.recv() => {
                    match cmd {
                        Some(Control::Unsubscribe { max_msgs: Some(limit) }) if limit > 0 => {
                            remaining = Some(limit);
                        }
                        Some(Control::Unsubscribe { .. }) | None => break,
                    }
                }

                next = subscriber.next() => {
                    let Some(msg) = next else {
                        log_debug!("{transport_id}: broker ended subscription");
                        return;
                    };
                    if inbox.send(into_message(msg)).await.is_err() {
                        break;
                    }
                    if let Some(left) = remaining.as_mut() {
                        *left -= 1;
                        if *left == 0 {
                            break;
                        }
                    }
                }
            }
        }

        if let Err(_err) = subscriber.unsubscribe().await {
            log_warn!("{transport_id}: unsubscribe failed: {_err}");
        }
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn is_connected(&self) -> bool {
        !self.latch.is_fired() && self.client.connection_state() == State::Connected
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        self.ensure_connected()?;

        let subject = msg.subject.to_string();
        let outcome = match (msg.reply, msg.headers) {
            (Some(reply), Some(headers)) => {
                self.client
                    .publish_with_reply_and_headers(
                        subject,
                        reply.to_string(),
                        into_header_map(&headers),
                        msg.payload,
                    )
                    .await
            }
            (Some(reply), None) => {
                self.client
                    .publish_with_reply(subject, reply.to_string(), msg.payload)
                    .await
            }
            (None, Some(headers)) => {
                self.client
                    .publish_with_headers(subject, into_header_map(&headers), msg.payload)
                    .await
            }
            (None, None) => self.client.publish(subject, msg.payload).await,
        };

        outcome.map_err(|err| {
            log_error!("{}: publish failed: {err}", self.transport_id);
            RpcError::Transport(err.to_string())
        })
    }

    async fn flush(&self) -> Result<()> {
        // ---
        self.ensure_connected()?;
        self.client
            .flush()
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message> {
        // ---
        self.ensure_connected()?;

        let reply = tokio::time::timeout(timeout, self.client.request(subject.to_string(), payload))
            .await
            .map_err(|_elapsed| RpcError::Timeout)?;

        match reply {
            Ok(msg) => Ok(into_message(msg)),
            Err(err) => match err.kind() {
                RequestErrorKind::TimedOut => Err(RpcError::Timeout),
                RequestErrorKind::NoResponders => Err(RpcError::NoResponders(subject.to_string())),
                _ => Err(RpcError::Transport(err.to_string())),
            },
        }
    }

    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_connected()?;

        let subscriber = match queue {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_string(), queue.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|err| RpcError::Transport(err.to_string()))?;

        let id = SubscriptionId::generate();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(4);

        let entry = self.pumps.insert(id.clone(), control_tx);

        tokio::spawn(Self::pump(
            self.transport_id.clone(),
            entry,
            subscriber,
            inbox_tx,
            control_rx,
        ));

        log_debug!("{}: subscribed to {subject} (queue {queue:?})", self.transport_id);
        Ok(SubscriptionHandle { id, inbox: inbox_rx })
    }

    async fn unsubscribe(&self, id: &SubscriptionId, max_msgs: Option<u64>) -> Result<()> {
        // ---
        let control = match max_msgs {
            Some(limit) if limit > 0 => self.pumps.get(id),
            _ => self.pumps.remove(id),
        };

        match control {
            Some(control) => {
                // A closed channel means the pump already exited.
                let _ = control.send(Control::Unsubscribe { max_msgs }).await;
                Ok(())
            }
            None => Err(RpcError::Transport(format!("unknown subscription {id}"))),
        }
    }

    async fn close(&self) -> Result<()> {
        // ---
        log_info!("{}: closing NATS transport", self.transport_id);

        // Dropping the control senders stops every pump.
        self.pumps.clear();

        let drained = self.client.drain().await;
        self.latch.fire();

        drained.map_err(|err| {
            log_error!("{}: drain failed: {err}", self.transport_id);
            RpcError::Transport(err.to_string())
        })
    }
}

/// Connect to the NATS servers named in `config`.
///
/// # Errors
///
/// - [`RpcError::InvalidConfig`] when a server address cannot be parsed
/// - [`RpcError::ConnectionFailed`] when no server accepts the connection
pub async fn create_transport(
    config: TransportConfig,
    on_closed: ClosedCallback,
) -> Result<TransportPtr> {
    // ---
    let addrs = config
        .servers
        .iter()
        .map(|server| {
            server
                .parse::<ServerAddr>()
                .map_err(|err| RpcError::InvalidConfig(format!("server address {server}: {err}")))
        })
        .collect::<Result<Vec<ServerAddr>>>()?;

    let latch = Arc::new(CloseLatch {
        fired: AtomicBool::new(false),
        on_closed,
    });

    let events_latch = latch.clone();
    let events_id = config.node_id.clone();

    let mut options = async_nats::ConnectOptions::new()
        .name(&config.node_id)
        .request_timeout(None)
        .event_callback(move |event| {
            let latch = events_latch.clone();
            let _transport_id = events_id.clone();
            async move {
                match event {
                    Event::Closed => latch.fire(),
                    Event::Disconnected => {
                        log_warn!("{_transport_id}: disconnected from NATS");
                    }
                    Event::Connected => {
                        log_info!("{_transport_id}: connected to NATS");
                    }
                    _other => {
                        log_debug!("{_transport_id}: NATS event {_other}");
                    }
                }
            }
        });

    if let Some(token) = config.token.clone() {
        options = options.token(token);
    }

    let client = options.connect(addrs.as_slice()).await.map_err(|err| {
        RpcError::ConnectionFailed {
            servers: config.servers.join(","),
            details: err.to_string(),
        }
    })?;

    log_info!("{}: connected to {}", config.node_id, config.servers.join(","));

    Ok(Arc::new(NatsTransport {
        transport_id: config.node_id,
        client,
        pumps: PumpRegistry::default(),
        latch,
    }))
}
