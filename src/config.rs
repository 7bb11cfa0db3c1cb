//! Public, transport-agnostic broker configuration.
//!
//! This type intentionally contains no client-library concepts. Transport
//! factories interpret it into concrete connection settings.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Default broker endpoint.
pub const DEFAULT_SERVER: &str = "nats://localhost:4222";

/// Default per-request timeout (10 000 ms).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Broker connection parameters.
///
/// Deserializable so hosts can load it from their own configuration files;
/// `request_timeout` is given in milliseconds there.
///
/// # Example
///
/// ```
/// use nats_service::BrokerConfig;
/// use std::time::Duration;
///
/// let config = BrokerConfig::with_servers(["nats://a:4222", "nats://b:4222"])
///     .with_token("s3cret")
///     .with_request_timeout(Duration::from_secs(2));
/// assert_eq!(config.servers.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    // ---
    /// Broker endpoints, in preference order. Must not be empty.
    pub servers: Vec<String>,

    /// Optional authentication token.
    pub token: Option<String>,

    /// Identifier of this broker connection, attached to every log line.
    pub node_id: String,

    /// Transport override: `"memory"` or `"nats"`. `None` selects by
    /// enabled cargo features.
    pub transport_type: Option<String>,

    /// Default timeout for [`Broker::call`](crate::Broker::call) and
    /// [`Emitter::emit`](crate::Emitter::emit).
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        // ---
        Self {
            servers: vec![DEFAULT_SERVER.to_string()],
            token: None,
            node_id: "nats-service".to_string(),
            transport_type: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BrokerConfig {
    /// Create a config for the given servers.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Create an in-memory config (no broker).
    pub fn memory(node_id: impl Into<String>) -> Self {
        Self {
            servers: vec!["memory://".to_string()],
            node_id: node_id.into(),
            transport_type: Some("memory".to_string()),
            ..Self::default()
        }
    }

    /// Read overrides from the environment on top of the defaults.
    ///
    /// | Variable                  | Field             |
    /// |---------------------------|-------------------|
    /// | `NATS_SERVERS`            | `servers` (comma separated) |
    /// | `NATS_TOKEN`              | `token`           |
    /// | `NATS_NODE_ID`            | `node_id`         |
    /// | `NATS_TRANSPORT`          | `transport_type`  |
    /// | `NATS_REQUEST_TIMEOUT_MS` | `request_timeout` |
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] when `NATS_REQUEST_TIMEOUT_MS` is
    /// not a number, or [`RpcError::MissingConfig`] when `NATS_SERVERS` names
    /// no server.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let mut config = Self::default();

        if let Some(servers) = lookup("NATS_SERVERS") {
            config.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(token) = lookup("NATS_TOKEN") {
            config.token = Some(token);
        }
        if let Some(node_id) = lookup("NATS_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(transport) = lookup("NATS_TRANSPORT") {
            config.transport_type = Some(transport);
        }
        if let Some(ms) = lookup("NATS_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                RpcError::InvalidConfig(format!("NATS_REQUEST_TIMEOUT_MS is not a number: {ms}"))
            })?;
            config.request_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the authentication token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the node id.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Check invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingConfig`] when `servers` is empty.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.servers.is_empty() {
            return Err(RpcError::MissingConfig("servers".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        // ---
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_local_broker() {
        // ---
        let config = BrokerConfig::default();
        assert_eq!(config.servers, vec!["nats://localhost:4222"]);
        assert_eq!(config.request_timeout, Duration::from_millis(10_000));
        assert!(config.token.is_none());
    }

    #[test]
    fn env_overrides_are_applied() {
        // ---
        let config = BrokerConfig::from_lookup(lookup(&[
            ("NATS_SERVERS", "nats://a:4222, nats://b:4222"),
            ("NATS_TOKEN", "t0k"),
            ("NATS_REQUEST_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.servers, vec!["nats://a:4222", "nats://b:4222"]);
        assert_eq!(config.token.as_deref(), Some("t0k"));
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn empty_server_list_is_rejected() {
        // ---
        let err = BrokerConfig::from_lookup(lookup(&[("NATS_SERVERS", " , ")])).unwrap_err();
        assert!(matches!(err, RpcError::MissingConfig(field) if field == "servers"));
    }

    #[test]
    fn bad_timeout_is_rejected() {
        // ---
        let err = BrokerConfig::from_lookup(lookup(&[("NATS_REQUEST_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[test]
    fn deserializes_with_defaults() {
        // ---
        let config: BrokerConfig =
            serde_json::from_str(r#"{"node_id": "billing", "request_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.node_id, "billing");
        assert_eq!(config.servers, vec![DEFAULT_SERVER]);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
    }
}
