// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines internal domain abstractions used by the connection
//! manager, client and server layers. It describes the small slice of a
//! message broker that request/reply RPC needs:
//!
//! - a single **direct-routed exchange** that requests are published to, with
//!   the method name as routing key,
//! - **queues** (server-named and exclusive, or explicitly named) that are
//!   bound to that exchange,
//! - **consumers** that receive envelopes from a queue,
//! - the **default exchange** (`""`), which routes a reply straight to the
//!   queue named by its routing key,
//! - a **shutdown signal** telling the owner why a session ended.
//!
//! Concrete implementations of these traits live under `src/transport/`.
use crate::Result;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

/// Name of the broker's default exchange.
///
/// Publishing to the default exchange delivers to the queue whose name equals
/// the routing key, which is how replies reach a caller's reply queue.
pub const DEFAULT_EXCHANGE: &str = "";

/// Who ended a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// The local application closed the session (`close()` / `stop()`).
    Application,
    /// The broker closed the session or the network dropped it.
    Peer,
    /// The client library gave up on the session (protocol or I/O error).
    Library,
}

/// Why a broker session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownEvent {
    pub initiator: ShutdownInitiator,
    pub reason: Arc<str>,
}

impl ShutdownEvent {
    pub fn application(reason: impl Into<Arc<str>>) -> Self {
        Self {
            initiator: ShutdownInitiator::Application,
            reason: reason.into(),
        }
    }

    pub fn peer(reason: impl Into<Arc<str>>) -> Self {
        Self {
            initiator: ShutdownInitiator::Peer,
            reason: reason.into(),
        }
    }

    pub fn library(reason: impl Into<Arc<str>>) -> Self {
        Self {
            initiator: ShutdownInitiator::Library,
            reason: reason.into(),
        }
    }

    /// True when the shutdown was not requested by this process.
    pub fn is_unexpected(&self) -> bool {
        self.initiator != ShutdownInitiator::Application
    }
}

impl fmt::Display for ShutdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.initiator, self.reason)
    }
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base` so the default
/// `Transport` methods for identity and shutdown signalling live in one place.
pub struct TransportBase {
    /// Identifier of this session, used for logging.
    pub transport_id: String,
    shutdown: Arc<watch::Sender<Option<ShutdownEvent>>>,
}

impl TransportBase {
    pub fn new(transport_id: impl Into<String>) -> Self {
        // ---
        let (shutdown, _) = watch::channel(None);
        Self {
            transport_id: transport_id.into(),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Handle that background tasks (consumers, broker callbacks) use to
    /// report the end of the session.
    pub fn shutdown_notifier(&self) -> ShutdownNotifier {
        ShutdownNotifier(self.shutdown.clone())
    }
}

/// Reports the end of a broker session. Only the first report is kept.
#[derive(Clone)]
pub struct ShutdownNotifier(Arc<watch::Sender<Option<ShutdownEvent>>>);

impl ShutdownNotifier {
    /// Record `event` unless a shutdown was already recorded.
    ///
    /// Returns `true` if this call recorded the shutdown.
    pub fn notify(&self, event: ShutdownEvent) -> bool {
        // ---
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(event);
            true
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Declaration parameters for a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name; `None` asks the broker to generate one.
    pub name: Option<String>,
    /// Exclusive to the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A broker-named, exclusive, auto-delete queue.
    ///
    /// Used for client reply queues and, by default, the server inbound queue.
    pub fn private() -> Self {
        Self {
            name: None,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// A named, non-exclusive queue that several servers may consume from.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            exclusive: false,
            auto_delete: true,
        }
    }
}

/// The wire unit exchanged through the broker.
///
/// Requests are published to the RPC exchange with the method name as
/// routing key. Replies are published to the default exchange with the
/// caller's reply queue as routing key. The transport does not interpret the
/// body.
///
/// # Examples
///
/// ```
/// # use amqp_rpc::Envelope;
/// # use bytes::Bytes;
/// let request = Envelope::request(
///     "rpc".into(),
///     "Echo".into(),
///     "correlation-123".into(),
///     "amq.gen-reply".into(),
///     Bytes::from_static(br#"{"x":1}"#),
/// );
/// assert_eq!(&*request.routing_key, "Echo");
///
/// let reply = Envelope::reply(
///     "amq.gen-reply".into(),
///     "correlation-123".into(),
///     Bytes::from_static(br#"{"x":1}"#),
///     "application/json".into(),
/// );
/// assert!(reply.is_default_exchange());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    // ---
    /// Exchange the envelope is (or was) published to.
    pub exchange: Arc<str>,

    /// Method name for requests; the reply queue name for replies.
    pub routing_key: Arc<str>,

    /// Correlation identifier linking a reply to its request.
    pub correlation_id: Option<Arc<str>>,

    /// Queue the reply must be sent to. Only present on requests.
    pub reply_to: Option<Arc<str>>,

    /// Body format. Error replies use [`ERROR_CONTENT_TYPE`](crate::ERROR_CONTENT_TYPE).
    pub content_type: Option<Arc<str>>,

    /// Opaque payload bytes.
    pub body: Bytes,
}

impl Envelope {
    /// Create a request envelope routed by method name.
    pub fn request(
        exchange: Arc<str>,
        method: Arc<str>,
        correlation_id: Arc<str>,
        reply_to: Arc<str>,
        body: Bytes,
    ) -> Self {
        // ---
        Self {
            exchange,
            routing_key: method,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(crate::codec::JSON_CONTENT_TYPE.into()),
            body,
        }
    }

    /// Create a reply envelope addressed straight to a reply queue.
    pub fn reply(
        reply_to: Arc<str>,
        correlation_id: Arc<str>,
        body: Bytes,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            exchange: DEFAULT_EXCHANGE.into(),
            routing_key: reply_to,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(content_type),
            body,
        }
    }

    pub fn is_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }
}

/// Handle returned from a successful `consume()`.
///
/// The inbox yields `None` once the queue is deleted, the consumer is
/// cancelled, or the session ends. Dropping the handle cancels consumption.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for envelopes delivered from the queue.
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

/// One live broker session.
///
/// Implementations must ensure that:
/// - declarations are idempotent: re-declaring an existing exchange, queue or
///   binding is not an error,
/// - once `consume()` returns, messages routed to the queue are deliverable
///   to the returned handle,
/// - an unexpected end of the session is reported exactly once through the
///   shutdown signal, with a non-`Application` initiator,
/// - `close()` reports an `Application` shutdown.
///
/// Publishes through a single transport are not required to be safe to
/// interleave; the connection manager serializes them.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Identifier of this session.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Watch that becomes `Some` when the session ends.
    fn shutdown_signal(&self) -> watch::Receiver<Option<ShutdownEvent>> {
        self.base().shutdown.subscribe()
    }

    /// True until the session ends.
    fn is_open(&self) -> bool {
        self.base().shutdown.borrow().is_none()
    }

    /// Declare a direct-routed exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a queue and return its (possibly broker-generated) name.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<Arc<str>>;

    /// Bind `queue` to `exchange` for `routing_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming from `queue`.
    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle>;

    /// Publish an envelope to `env.exchange` with `env.routing_key`.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Close the session and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only bumps a reference count; clones share one session.
pub type TransportPtr = Arc<dyn Transport>;

/// Opens broker sessions.
///
/// A connector is long lived; the connection manager asks it for a fresh
/// session on start-up and after every unexpected shutdown.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session.
    ///
    /// Must fail with [`RpcError::BrokerUnreachable`](crate::RpcError::BrokerUnreachable)
    /// for failures worth retrying; any other error aborts the connect loop.
    async fn connect(&self, connection_name: &str) -> Result<TransportPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
