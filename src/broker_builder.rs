//! Broker builder.
//!
//! Provides a fluent builder API for configuring broker instances with
//! servers, credentials and request timeouts.

use crate::transport::MemoryHub;
use crate::{Broker, BrokerConfig, Result, RpcError};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating [`Broker`] instances.
///
/// Starts from [`BrokerConfig::default`]; every setter overrides one field.
/// The built broker is disconnected.
///
/// # Examples
///
/// ## Broker against a NATS cluster
/// ```no_run
/// use nats_service::BrokerBuilder;
/// use std::time::Duration;
///
/// # async fn example() -> nats_service::Result<()> {
/// let broker = BrokerBuilder::new()
///     .server("nats://n1:4222")
///     .server("nats://n2:4222")
///     .token("s3cret")
///     .node_id("billing")
///     .request_timeout(Duration::from_secs(2))
///     .build()?;
/// broker.connect().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Isolated in-memory broker
/// ```
/// use nats_service::{BrokerBuilder, MemoryHub};
///
/// let broker = BrokerBuilder::new()
///     .memory_hub(MemoryHub::new())
///     .node_id("test")
///     .build()
///     .unwrap();
/// assert!(!broker.is_connected());
/// ```
#[derive(Debug, Default)]
pub struct BrokerBuilder {
    // ---
    config: BrokerConfig,

    // Explicit servers replace the default list instead of extending it.
    servers: Option<Vec<String>>,
    memory_hub: Option<Arc<MemoryHub>>,
}

impl BrokerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: BrokerConfig) -> Self {
        // ---
        Self {
            config,
            servers: None,
            memory_hub: None,
        }
    }

    /// Replace the server list.
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = Some(servers.into_iter().map(Into::into).collect());
        self
    }

    /// Add one server.
    ///
    /// The first call replaces the default server.
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.servers.get_or_insert_with(Vec::new).push(server.into());
        self
    }

    /// Set the authentication token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Set the node id used to label log output.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = id.into();
        self
    }

    /// Force a transport: `"memory"` or `"nats"`.
    pub fn transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.config.transport_type = Some(transport_type.into());
        self
    }

    /// Set the default request timeout.
    ///
    /// Default: 10s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Use an explicit in-memory hub.
    ///
    /// Implies the memory transport unless a transport type was set.
    pub fn memory_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.memory_hub = Some(hub);
        self
    }

    /// Build the broker (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingConfig`] when the server list is empty, or
    /// [`RpcError::InvalidConfig`] when the request timeout is zero.
    pub fn build(self) -> Result<Broker> {
        // ---
        let mut config = self.config;
        if let Some(servers) = self.servers {
            config.servers = servers;
        }

        config.validate()?;
        if config.request_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("request_timeout must be non-zero".into()));
        }

        Ok(Broker::new(config, self.memory_hub))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults_to_local_server() {
        // ---
        let broker = BrokerBuilder::new().build().unwrap();
        assert_eq!(broker.config().servers, vec!["nats://localhost:4222"]);
        assert_eq!(broker.config().request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn server_calls_replace_the_default() {
        // ---
        let broker = BrokerBuilder::new()
            .server("nats://a:4222")
            .server("nats://b:4222")
            .build()
            .unwrap();
        assert_eq!(broker.config().servers, vec!["nats://a:4222", "nats://b:4222"]);
    }

    #[test]
    fn empty_server_list_is_rejected() {
        // ---
        let err = BrokerBuilder::new()
            .servers(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, RpcError::MissingConfig(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        // ---
        let err = BrokerBuilder::new()
            .request_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }
}
