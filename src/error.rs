use thiserror::Error;

/// Boxed error returned by action handlers and validators.
///
/// Any error type can be propagated out of handler code with `?`; its
/// `Display` output becomes the `message` of the failure reply.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the broker facade.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Operation attempted without a live transport session.
    #[error("broker is not connected")]
    NotConnected,

    /// The transport session could not be established.
    #[error("failed to connect to {servers}: {details}")]
    ConnectionFailed { servers: String, details: String },

    /// The remote handler replied with `ok: false`.
    ///
    /// Displays the remote-supplied message verbatim.
    #[error("{0}")]
    Remote(String),

    /// Inbound payload bytes could not be parsed.
    #[error("{0}")]
    Decode(String),

    /// Outbound payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// An action validator rejected the payload.
    #[error("{0}")]
    Validation(String),

    /// An action handler failed during execution.
    #[error("{0}")]
    Handler(String),

    /// Request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Nothing is subscribed on the requested subject.
    #[error("no responders available for request on {0}")]
    NoResponders(String),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Required configuration is missing.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Configuration was supplied but is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, RpcError>;
