//! Action schema: one named unit of request-handling logic.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{BoxError, CallContext, Result, RpcError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased async action handler.
type ActionHandler =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync>;

/// Type-erased payload validator.
type Validator = Arc<dyn Fn(Map<String, Value>) -> std::result::Result<Value, BoxError> + Send + Sync>;

/// Describes an action that can be registered against a broker.
///
/// - `name` is the last segment of the action's canonical subject.
/// - `queue` (default `true`) makes each worker subscription join a queue
///   group; with `false` every subscription receives every message.
/// - `validate` optionally normalizes the decoded payload before the
///   handler sees it.
///
/// Schemas are immutable once built and cheap to clone.
///
/// ```
/// use nats_service::{ActionSchema, BoxError};
///
/// let echo = ActionSchema::new("echo", |ctx| async move {
///     Ok::<_, BoxError>(ctx.payload().clone())
/// })
/// .expect("non-empty name")
/// .queue(false);
/// assert_eq!(echo.name(), "echo");
/// ```
#[derive(Clone)]
pub struct ActionSchema {
    // ---
    name: Arc<str>,
    handle: ActionHandler,
    queue: bool,
    validate: Option<Validator>,
}

impl ActionSchema {
    // ---
    /// Create a schema from a name and an async handler.
    ///
    /// The handler may return any serializable value and any error
    /// convertible into [`BoxError`]; the error's `Display` output becomes
    /// the failure reply message.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] if `name` is empty.
    pub fn new<F, Fut, R, E>(name: impl Into<Arc<str>>, handler: F) -> Result<Self>
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        // ---
        let name = name.into();
        if name.is_empty() {
            return Err(RpcError::InvalidConfig("action name must not be empty".into()));
        }

        let handle: ActionHandler = Arc::new(
            move |ctx: CallContext| -> BoxFuture<'static, std::result::Result<Value, BoxError>> {
                let fut = handler(ctx);
                Box::pin(async move {
                    match fut.await {
                        Ok(result) => serde_json::to_value(result).map_err(BoxError::from),
                        Err(err) => Err(err.into()),
                    }
                })
            },
        );

        Ok(Self {
            name,
            handle,
            queue: true,
            validate: None,
        })
    }

    /// Set queue-group participation.
    pub fn queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

    /// Attach a validator.
    ///
    /// The decoded payload must be a JSON object; its fields are passed to
    /// `validator` and the returned value replaces the payload.
    pub fn validate<F, R, E>(mut self, validator: F) -> Self
    where
        F: Fn(Map<String, Value>) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: Into<BoxError>,
    {
        // ---
        self.validate = Some(Arc::new(
            move |fields: Map<String, Value>| -> std::result::Result<Value, BoxError> {
                match validator(fields) {
                    Ok(normalized) => serde_json::to_value(normalized).map_err(BoxError::from),
                    Err(err) => Err(err.into()),
                }
            },
        ));
        self
    }

    /// Use the serde type `T` as validator.
    ///
    /// The payload is deserialized into `T` (applying its defaults and
    /// rejecting missing or mistyped fields) and serialized back as the
    /// normalized payload.
    pub fn validate_as<T>(self) -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.validate(|fields| serde_json::from_value::<T>(Value::Object(fields)))
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether worker subscriptions join queue groups.
    pub fn is_queued(&self) -> bool {
        self.queue
    }

    /// Whether a validator is attached.
    pub fn has_validator(&self) -> bool {
        self.validate.is_some()
    }

    /// Run the validator, if any, over `payload`.
    ///
    /// Without a validator the payload is returned unchanged.
    pub(crate) fn normalize(&self, payload: Value) -> std::result::Result<Value, BoxError> {
        // ---
        let Some(validator) = self.validate.as_ref() else {
            return Ok(payload);
        };
        match payload {
            Value::Object(fields) => validator(fields),
            other => Err(format!("payload must be a JSON object, got {}", json_kind(&other)).into()),
        }
    }

    /// Invoke the handler.
    pub(crate) async fn invoke(&self, ctx: CallContext) -> std::result::Result<Value, BoxError> {
        (self.handle)(ctx).await
    }
}

fn json_kind(value: &Value) -> &'static str {
    // ---
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl fmt::Debug for ActionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("ActionSchema")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("validate", &self.validate.is_some())
            .finish_non_exhaustive()
    }
}
