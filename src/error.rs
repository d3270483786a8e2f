use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// The connect retry budget was exhausted before the broker accepted a connection.
    #[error("connection to broker timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker could not be reached. Retried by the connection manager.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// No reply arrived before the call timeout elapsed.
    #[error("call timed out waiting for reply")]
    CallTimeout,

    /// The caller cancelled the call before a reply arrived.
    #[error("call cancelled")]
    CallCancelled,

    /// No registration exists for the requested method name.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A method name was registered twice.
    #[error("method already registered: {0}")]
    DuplicateRegistration(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The instance resolver has no instance for the owning controller.
    #[error("no instance available for controller {0}")]
    ControllerUnavailable(&'static str),

    /// A handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The server answered the call with an error reply.
    #[error("remote {kind} error: {message}")]
    Remote { kind: String, message: String },

    /// Broker or channel level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation needed a live connection and there is none.
    #[error("not connected to broker")]
    NotConnected,

    /// The client or server was stopped while the operation was in progress.
    #[error("shut down")]
    Shutdown,

    /// A reply envelope was malformed.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Convenience constructor for handler failures.
    pub fn handler(msg: impl Into<String>) -> Self {
        RpcError::Handler(msg.into())
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
