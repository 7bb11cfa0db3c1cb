//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. The NATS transport inherits the same semantics from the broker.
//!
//! In particular, the in-memory transport establishes the following expectations:
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point and matching the subscription are deliverable.
//! - Subjects match exactly; there are no wildcards.
//! - Subscribers without a queue group each receive every message.
//! - Subscribers sharing a `(subject, queue)` pair receive messages in
//!   round-robin order, one member per message.
//! - A request with no matching subscriber fails fast with `NoResponders`.
//!
//! ## Non-Goals
//!
//! This transport does not attempt to emulate the failure modes, persistence,
//! or delivery guarantees of any specific broker.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::{
    // ---
    log_debug,
    log_warn,
    ClosedCallback,
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

/// Snapshot of one live subscription on a [`MemoryHub`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Subscribed subject.
    pub subject: String,
    /// Queue group, if any.
    pub queue: Option<String>,
}

struct Entry {
    owner: Arc<str>,
    seq: u64,
    subject: Arc<str>,
    queue: Option<Arc<str>>,
    tx: mpsc::Sender<Message>,
    remaining: Option<u64>,
}

#[derive(Default)]
struct HubState {
    entries: HashMap<SubscriptionId, Entry>,
    cursors: HashMap<(Arc<str>, Arc<str>), usize>,
    next_seq: u64,
}

impl HubState {
    /// Pick delivery targets for a message on `subject` and account for them.
    fn route(&mut self, subject: &str) -> Vec<mpsc::Sender<Message>> {
        // ---
        self.entries.retain(|_, entry| !entry.tx.is_closed());

        let mut targets: Vec<SubscriptionId> = Vec::new();
        let mut groups: BTreeMap<Arc<str>, Vec<(u64, SubscriptionId)>> = BTreeMap::new();

        for (id, entry) in self.entries.iter() {
            if entry.subject.as_ref() != subject {
                continue;
            }
            match &entry.queue {
                None => targets.push(id.clone()),
                Some(queue) => groups
                    .entry(queue.clone())
                    .or_default()
                    .push((entry.seq, id.clone())),
            }
        }

        for (queue, mut members) in groups {
            members.sort_by_key(|(seq, _)| *seq);
            let cursor = self
                .cursors
                .entry((Arc::from(subject), queue))
                .or_insert(0);
            let (_, id) = &members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            targets.push(id.clone());
        }

        let mut senders = Vec::with_capacity(targets.len());
        for id in targets {
            let exhausted = match self.entries.get_mut(&id) {
                Some(entry) => {
                    senders.push(entry.tx.clone());
                    match entry.remaining.as_mut() {
                        Some(remaining) => {
                            *remaining = remaining.saturating_sub(1);
                            *remaining == 0
                        }
                        None => false,
                    }
                }
                None => false,
            };
            if exhausted {
                self.entries.remove(&id);
            }
        }
        senders
    }
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. All memory transports that
/// share a `MemoryHub` can publish and receive each other's messages, exactly
/// as clients connected to a real broker would.
///
/// # Usage in Integration Tests
///
/// For integration tests that need isolation between parallel test cases,
/// construct a hub explicitly and hand it to the broker builder:
///
/// ```
/// # use nats_service::{BrokerBuilder, MemoryHub};
/// let hub = MemoryHub::new();
/// let broker = BrokerBuilder::new()
///     .node_id("test")
///     .memory_hub(hub.clone())
///     .build()
///     .expect("valid config");
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// List live subscriptions, ordered by creation.
    ///
    /// Intended for tests that assert on subscription topology.
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        // ---
        let state = self.state.lock().await;
        let mut live: Vec<(u64, SubscriptionInfo)> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.tx.is_closed())
            .map(|(id, entry)| {
                let info = SubscriptionInfo {
                    id: id.clone(),
                    subject: entry.subject.to_string(),
                    queue: entry.queue.as_ref().map(|q| q.to_string()),
                };
                (entry.seq, info)
            })
            .collect();
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, info)| info).collect()
    }

    /// Route `msg` to matching subscribers; returns the number of deliveries.
    async fn publish(&self, transport_id: &str, msg: Message) -> usize {
        // ---
        let senders = {
            let mut state = self.state.lock().await;
            state.route(&msg.subject)
        };

        log_debug!(
            "{transport_id}: publish to {} ({} receivers)",
            msg.subject,
            senders.len()
        );

        let mut delivered = 0;
        for sender in senders {
            // A closed channel indicates a dropped SubscriptionHandle.
            match sender.send(msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(_err) => {
                    log_debug!("{transport_id}: receiver for {} went away", msg.subject);
                }
            }
        }
        delivered
    }

    async fn subscribe(
        &self,
        owner: &Arc<str>,
        subject: &str,
        queue: Option<&str>,
    ) -> SubscriptionHandle {
        // ---
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let id = SubscriptionId::generate();

        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id.clone(),
            Entry {
                owner: owner.clone(),
                seq,
                subject: Arc::from(subject),
                queue: queue.map(Arc::from),
                tx,
                remaining: None,
            },
        );

        SubscriptionHandle { id, inbox: rx }
    }

    async fn unsubscribe(&self, id: &SubscriptionId, max_msgs: Option<u64>) {
        // ---
        let mut state = self.state.lock().await;
        match max_msgs {
            Some(limit) if limit > 0 => {
                if let Some(entry) = state.entries.get_mut(id) {
                    entry.remaining = Some(limit);
                }
            }
            _ => {
                state.entries.remove(id);
            }
        }
    }

    async fn close(&self, owner: &Arc<str>) {
        // ---
        let mut state = self.state.lock().await;
        state.entries.retain(|_, entry| entry.owner != *owner);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
        }
    }
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub").finish_non_exhaustive()
    }
}

/// Process-global hub used when no explicit hub is configured.
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// Routes messages through a shared [`MemoryHub`]. Each transport instance
/// owns the subscriptions it created; closing it removes them from the hub.
struct MemoryTransport {
    // ---
    transport_id: String,
    owner: Arc<str>,
    hub: Arc<MemoryHub>,
    connected: AtomicBool,
    on_closed: ClosedCallback,
}

impl MemoryTransport {
    fn ensure_connected(&self) -> Result<()> {
        // ---
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::NotConnected)
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        self.ensure_connected()?;
        self.hub.publish(&self.transport_id, msg).await;
        Ok(())
    }

    /// Delivery is synchronous with `publish()`, so there is never anything
    /// buffered to flush.
    async fn flush(&self) -> Result<()> {
        self.ensure_connected()
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message> {
        // ---
        self.ensure_connected()?;

        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut handle = self.hub.subscribe(&self.owner, &inbox, None).await;

        let msg = Message::new(subject, payload).with_reply(inbox.as_str());
        let delivered = self.hub.publish(&self.transport_id, msg).await;

        let outcome = if delivered == 0 {
            Err(RpcError::NoResponders(subject.to_string()))
        } else {
            match tokio::time::timeout(timeout, handle.inbox.recv()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(RpcError::Transport(format!(
                    "reply inbox for {subject} closed before a response arrived"
                ))),
                Err(_elapsed) => Err(RpcError::Timeout),
            }
        };

        self.hub.unsubscribe(&handle.id, None).await;
        outcome
    }

    async fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_connected()?;
        log_debug!("{}: subscribe to {subject} (queue {queue:?})", self.transport_id);
        Ok(self.hub.subscribe(&self.owner, subject, queue).await)
    }

    async fn unsubscribe(&self, id: &SubscriptionId, max_msgs: Option<u64>) -> Result<()> {
        // ---
        self.hub.unsubscribe(id, max_msgs).await;
        Ok(())
    }

    /// Close the transport.
    ///
    /// Removes this transport's subscriptions from the hub; subscriptions
    /// owned by other transports on the same hub are left untouched.
    async fn close(&self) -> Result<()> {
        // ---
        if self.connected.swap(false, Ordering::AcqRel) {
            log_debug!("{}: closing transport...", self.transport_id);
            self.hub.close(&self.owner).await;
            (self.on_closed)();
        } else {
            log_warn!("{}: close called on a closed transport", self.transport_id);
        }
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// Uses `config.memory_hub` when set, otherwise the process-global hub shared
/// by every memory transport in the process.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport(
    config: TransportConfig,
    on_closed: ClosedCallback,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.node_id);

    let hub = config.memory_hub.clone().unwrap_or_else(global_hub);
    let owner: Arc<str> = Arc::from(format!("{}#{}", config.node_id, uuid::Uuid::new_v4()));

    let transport = MemoryTransport {
        transport_id: config.node_id,
        owner,
        hub,
        connected: AtomicBool::new(true),
        on_closed,
    };

    Ok(Arc::new(transport))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(hub: &Arc<MemoryHub>) -> TransportConfig {
        // ---
        TransportConfig {
            servers: vec!["memory://".into()],
            token: None,
            node_id: "memory-test".into(),
            transport_type: Some("memory".into()),
            memory_hub: Some(hub.clone()),
        }
    }

    fn noop() -> ClosedCallback {
        Arc::new(|| {})
    }

    #[tokio::test]
    async fn queue_group_delivers_to_one_member_round_robin() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport(config(&hub), noop()).await.unwrap();

        let mut a = transport.subscribe("jobs", Some("workers")).await.unwrap();
        let mut b = transport.subscribe("jobs", Some("workers")).await.unwrap();

        for i in 0..4u8 {
            transport
                .publish(Message::new("jobs", Bytes::from(vec![i])))
                .await
                .unwrap();
        }

        let mut got_a = Vec::new();
        while let Ok(msg) = a.inbox.try_recv() {
            got_a.push(msg.payload[0]);
        }
        let mut got_b = Vec::new();
        while let Ok(msg) = b.inbox.try_recv() {
            got_b.push(msg.payload[0]);
        }

        assert_eq!(got_a, vec![0, 2]);
        assert_eq!(got_b, vec![1, 3]);
    }

    #[tokio::test]
    async fn unsubscribe_after_limit_closes_inbox() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport(config(&hub), noop()).await.unwrap();

        let mut handle = transport.subscribe("ticks", None).await.unwrap();
        transport.unsubscribe(&handle.id, Some(2)).await.unwrap();

        for _ in 0..3 {
            transport
                .publish(Message::new("ticks", Bytes::from_static(b"t")))
                .await
                .unwrap();
        }

        assert!(handle.inbox.recv().await.is_some());
        assert!(handle.inbox.recv().await.is_some());
        assert!(handle.inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn request_without_subscribers_reports_no_responders() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport(config(&hub), noop()).await.unwrap();

        let err = transport
            .request("nobody.home", Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NoResponders(subject) if subject == "nobody.home"));
        assert!(hub.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn close_fires_callback_once_and_disconnects() {
        // ---
        let hub = MemoryHub::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let on_closed: ClosedCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let transport = create_memory_transport(config(&hub), on_closed).await.unwrap();
        transport.subscribe("a", None).await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!transport.is_connected());
        assert!(hub.subscriptions().await.is_empty());
        assert!(matches!(
            transport.publish(Message::new("a", Bytes::new())).await,
            Err(RpcError::NotConnected)
        ));
    }
}
