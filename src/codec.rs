//! JSON codec glue.
//!
//! Payload encoding is delegated to `serde_json`. The RPC layer only adds two
//! rules on top:
//!
//! - an empty body decodes as JSON `null`, so parameterless calls and void
//!   replies round-trip through `()` and `Option<T>`,
//! - a result that encodes to `null` is sent as an empty body.
//!
//! Error replies carry [`ERROR_CONTENT_TYPE`] and an [`ErrorReply`] body.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Content type of successful replies and of requests.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type marking a reply as an [`ErrorReply`].
pub const ERROR_CONTENT_TYPE: &str = "application/vnd.amqp-rpc.error+json";

/// Encode a request parameter.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Encode a handler result; `null` becomes an empty body.
pub fn encode_result<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    // ---
    let value = serde_json::to_value(value)?;
    if value.is_null() {
        return Ok(Bytes::new());
    }
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Decode a body; an empty body decodes as `null`.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    // ---
    if body.is_empty() {
        return Ok(serde_json::from_slice(b"null")?);
    }
    Ok(serde_json::from_slice(body)?)
}

/// Category of a failure reported through an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownMethod,
    Serialization,
    ControllerUnavailable,
    Handler,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownMethod => "unknown_method",
            ErrorKind::Serialization => "serialization",
            ErrorKind::ControllerUnavailable => "controller_unavailable",
            ErrorKind::Handler => "handler",
        }
    }
}

/// Body of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    /// Describe a server-side dispatch failure for the caller.
    pub fn from_error(method: &str, err: &RpcError) -> Self {
        // ---
        let kind = match err {
            RpcError::UnknownMethod(_) => ErrorKind::UnknownMethod,
            RpcError::Serialization(_) => ErrorKind::Serialization,
            RpcError::ControllerUnavailable(_) => ErrorKind::ControllerUnavailable,
            _ => ErrorKind::Handler,
        };
        let message = match err {
            RpcError::UnknownMethod(_) => method.to_string(),
            other => other.to_string(),
        };
        Self { kind, message }
    }

    /// Turn a received error reply back into the caller-facing error.
    pub fn into_error(self) -> RpcError {
        // ---
        match self.kind {
            ErrorKind::UnknownMethod => RpcError::UnknownMethod(self.message),
            kind => RpcError::Remote {
                kind: kind.as_str().to_string(),
                message: self.message,
            },
        }
    }
}
