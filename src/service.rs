//! Service registrar: collect actions, then bind them against a broker.

use std::collections::HashSet;

use crate::{
    // ---
    log_debug,
    log_info,
    ActionSchema,
    Broker,
    Result,
    RpcError,
    Subscription,
};

/// One or many actions, accepted by [`ServiceRegistrar::add`].
#[derive(Debug, Clone, Default)]
pub struct Actions(Vec<ActionSchema>);

impl From<ActionSchema> for Actions {
    fn from(action: ActionSchema) -> Self {
        Actions(vec![action])
    }
}

impl From<Vec<ActionSchema>> for Actions {
    fn from(actions: Vec<ActionSchema>) -> Self {
        Actions(actions)
    }
}

impl<const N: usize> From<[ActionSchema; N]> for Actions {
    fn from(actions: [ActionSchema; N]) -> Self {
        Actions(actions.into())
    }
}

/// Collects actions of one service and registers them.
///
/// ```
/// # async fn example() -> nats_service::Result<()> {
/// use nats_service::{ActionSchema, BoxError, Broker, MemoryHub, ServiceRegistrar};
///
/// let broker = Broker::builder().memory_hub(MemoryHub::new()).build()?;
/// broker.connect().await?;
///
/// let mut service = ServiceRegistrar::new("1", "svc", 2)?;
/// service.add(ActionSchema::new("echo", |ctx| async move {
///     Ok::<_, BoxError>(ctx.payload().clone())
/// })?);
/// let subscriptions = service.register(&broker).await?;
/// assert_eq!(subscriptions.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ServiceRegistrar {
    // ---
    version: String,
    name: String,
    workers: usize,
    actions: Vec<ActionSchema>,

    // (action index, worker index) pairs bound on session `bound_session`.
    bound: HashSet<(usize, usize)>,
    bound_session: Option<u64>,
}

impl ServiceRegistrar {
    // ---
    /// Create a registrar for service `name` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] when `workers` is zero.
    pub fn new(version: impl Into<String>, name: impl Into<String>, workers: usize) -> Result<Self> {
        // ---
        if workers == 0 {
            return Err(RpcError::InvalidConfig("workers must be at least 1".into()));
        }
        Ok(Self {
            version: version.into(),
            name: name.into(),
            workers,
            actions: Vec::new(),
            bound: HashSet::new(),
            bound_session: None,
        })
    }

    /// Create a registrar with a single worker per action.
    pub fn single(version: impl Into<String>, name: impl Into<String>) -> Self {
        // ---
        Self {
            version: version.into(),
            name: name.into(),
            workers: 1,
            actions: Vec::new(),
            bound: HashSet::new(),
            bound_session: None,
        }
    }

    /// Append one action or a list of actions, preserving order.
    pub fn add(&mut self, actions: impl Into<Actions>) -> &mut Self {
        self.actions.extend(actions.into().0);
        self
    }

    /// Actions collected so far.
    pub fn actions(&self) -> &[ActionSchema] {
        &self.actions
    }

    /// Service version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker subscriptions per action.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Bind every action not yet bound on `broker`'s live session.
    ///
    /// Returns the subscriptions created by this call. Pairs bound by an
    /// earlier call on the same session are skipped, so registering twice
    /// without adding actions creates nothing. After a reconnect, or on a
    /// different broker, everything is bound again.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotConnected`] when `broker` has no session. Pairs
    /// bound before a failure stay bound.
    pub async fn register(&mut self, broker: &Broker) -> Result<Vec<Subscription>> {
        // ---
        let session = broker.session_id()?;
        if self.bound_session != Some(session) {
            if !self.bound.is_empty() {
                log_debug!(
                    node = broker.node_id(),
                    "v{}.{}: new session {session}, rebinding all actions",
                    self.version,
                    self.name
                );
            }
            self.bound.clear();
            self.bound_session = Some(session);
        }

        let mut created = Vec::new();
        let mut skipped = 0usize;

        for (index, action) in self.actions.iter().enumerate() {
            for worker in 0..self.workers {
                if self.bound.contains(&(index, worker)) {
                    skipped += 1;
                    continue;
                }
                let subscription = broker
                    .bind_action(&self.version, &self.name, action, worker)
                    .await?;
                self.bound.insert((index, worker));
                created.push(subscription);
            }
        }

        if skipped > 0 {
            log_debug!(
                node = broker.node_id(),
                "v{}.{}: skipped {skipped} already registered subscriptions",
                self.version,
                self.name
            );
        }
        log_info!(
            node = broker.node_id(),
            "v{}.{}: registered {} subscriptions",
            self.version,
            self.name,
            created.len()
        );

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{BoxError, CallContext, MemoryHub};

    fn action(name: &str) -> ActionSchema {
        // ---
        ActionSchema::new(name, |ctx: CallContext| async move {
            Ok::<_, BoxError>(ctx.payload().clone())
        })
        .unwrap()
    }

    #[test]
    fn zero_workers_is_rejected() {
        // ---
        let err = ServiceRegistrar::new("1", "svc", 0).unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[test]
    fn add_accepts_one_or_many_in_order() {
        // ---
        let mut service = ServiceRegistrar::new("1", "svc", 1).unwrap();
        service.add(action("a"));
        service.add(vec![action("b"), action("c")]);
        service.add([action("d")]);

        let names: Vec<&str> = service.actions().iter().map(ActionSchema::name).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn register_binds_each_pair_once() {
        // ---
        let broker = Broker::builder().memory_hub(MemoryHub::new()).build().unwrap();
        broker.connect().await.unwrap();

        let mut service = ServiceRegistrar::new("1", "svc", 2).unwrap();
        service.add(action("a"));
        assert_eq!(service.register(&broker).await.unwrap().len(), 2);
        assert!(service.register(&broker).await.unwrap().is_empty());

        service.add(action("b"));
        let created = service.register(&broker).await.unwrap();
        let subjects: Vec<&str> = created.iter().map(Subscription::subject).collect();
        assert_eq!(subjects, ["v1.svc.b", "v1.svc.b"]);
    }

    #[test]
    fn single_uses_one_worker() {
        // ---
        let service = ServiceRegistrar::single("1", "svc");
        assert_eq!(service.workers(), 1);
        assert_eq!(service.version(), "1");
        assert_eq!(service.name(), "svc");
        assert!(service.actions().is_empty());
    }

    #[tokio::test]
    async fn register_rebinds_after_reconnect() {
        // ---
        let hub = MemoryHub::new();
        let broker = Broker::builder().memory_hub(hub.clone()).build().unwrap();
        broker.connect().await.unwrap();

        let mut service = ServiceRegistrar::single("1", "svc");
        service.add(action("echo"));
        assert_eq!(service.register(&broker).await.unwrap().len(), 1);

        broker.close().await.unwrap();
        broker.connect().await.unwrap();
        assert_eq!(service.register(&broker).await.unwrap().len(), 1);
        assert_eq!(hub.subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn register_requires_a_session() {
        // ---
        let broker = Broker::builder().memory_hub(MemoryHub::new()).build().unwrap();
        let mut service = ServiceRegistrar::new("1", "svc", 1).unwrap();
        service.add(action("a"));

        let err = service.register(&broker).await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected));
    }
}
