//! JSON payload codec and the request/reply envelope.
//!
//! Request payloads are the caller's value encoded as JSON. Reply payloads
//! are always one of:
//!
//! ```text
//! {"ok": true,  "result": <value>}
//! {"ok": false, "message": <string>}
//! ```
//!
//! Non-primitive values take part through their `serde::Serialize`
//! implementation, which is the hook for custom JSON representations.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, RpcError};

/// Encode `payload` as JSON bytes.
///
/// # Errors
///
/// Returns [`RpcError::Encode`] when the value's `Serialize` impl fails
/// (for example a map with non-string keys).
pub fn encode<T>(payload: &T) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    // ---
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|err| RpcError::Encode(err.to_string()))
}

/// Decode JSON bytes into `T`.
///
/// # Errors
///
/// Returns [`RpcError::Decode`] when the bytes are not valid JSON for `T`.
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(bytes).map_err(|err| RpcError::Decode(err.to_string()))
}

/// Decode JSON bytes into an untyped value.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    decode::<Value>(bytes)
}

/// Reply envelope exchanged on request/reply subjects.
///
/// Field names and shape are part of the wire contract; `result` and
/// `message` are omitted when absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    // ---
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReplyEnvelope {
    // ---
    /// Successful reply carrying `result`.
    pub fn success(result: Value) -> Self {
        // ---
        Self {
            ok: true,
            result: Some(result),
            message: None,
        }
    }

    /// Failed reply carrying a human-readable `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        // ---
        Self {
            ok: false,
            result: None,
            message: Some(message.into()),
        }
    }

    /// The result value of a successful reply (`null` when absent).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Remote`] with the remote message when `ok` is false.
    pub fn into_result(self) -> Result<Value> {
        // ---
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(RpcError::Remote(self.message.unwrap_or_default()))
        }
    }
}

/// Pluggable payload decoder for pub/sub subscriptions.
///
/// [`Decoder::json`] is the default. Subscribing without a decoder delivers
/// the raw payload bytes untouched.
#[derive(Clone)]
pub struct Decoder(Arc<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>);

impl Decoder {
    /// JSON decoder.
    pub fn json() -> Self {
        Decoder(Arc::new(decode_value))
    }

    /// Decoder backed by a custom function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        Decoder(Arc::new(f))
    }

    /// Decode `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        (self.0)(bytes)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::json()
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Decoder")
    }
}
