//! Request/reply RPC over an AMQP broker with automatic correlation
//!
//! Clients publish requests to a direct exchange using the method name as
//! the routing key, and wait on a private reply queue for the answer that
//! carries the same correlation ID. Servers bind one queue to every
//! registered method name and dispatch each request to the matching
//! controller method. Both sides keep their broker session alive through a
//! connection manager that reconnects and replays topology on failure.
//!

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod client;
mod connection;
mod domain;
mod registry;
mod server;
mod transport;
mod transport_builder;

pub mod codec;

mod rpc_config;

mod correlation;
mod error;

// Re-export main types
pub use client::RpcClient;
pub use server::RpcServer;

pub use rpc_config::{ConnectRetry, RpcConfig, DEFAULT_RPC_EXCHANGE};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use codec::{ErrorKind, ErrorReply, ERROR_CONTENT_TYPE, JSON_CONTENT_TYPE};

pub use connection::{ConnectionHooks, ConnectionManager, ConnectionState};

pub use registry::{
    //
    Controller,
    Instance,
    InstanceResolver,
    Instances,
    MethodRegistration,
    MethodRegistry,
    MethodSet,
};

pub use transport::{MemoryConnector, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use transport::LapinConnector;

pub use transport_builder::{create_connector, TransportBuilder};

// --- public re-exports
pub use domain::{
    //
    Connector,
    ConnectorPtr,
    Envelope,
    QueueSpec,
    ShutdownEvent,
    ShutdownInitiator,
    ShutdownNotifier,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
    DEFAULT_EXCHANGE,
};
