// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains the [`RpcClient`] type which publishes requests to the
//! RPC exchange and matches replies to waiting calls.
//!
//! # Architecture
//!
//! On every (re)connect the client declares the request exchange, creates a
//! private, broker-named reply queue and starts a receive loop on it. Requests
//! carry that queue name as `reply_to`.
//!
//! Each call registers a oneshot channel in the pending map under a fresh
//! correlation ID **before** publishing, so a fast reply always finds its
//! entry. The receive loop looks the ID up and hands the reply body to the
//! waiting call. A reply whose ID is not pending (late, duplicate or foreign)
//! is dropped.
//!
//! The reply queue is remembered together with the session that declared it.
//! A request is only published through that same session, so it never names
//! a queue that died with an earlier connection.
//!
//! # Concurrency
//!
//! Multiple calls can be in flight simultaneously and replies may arrive in
//! any order. The pending map is a mutex-protected HashMap; contention is
//! minimal since operations are single insert/remove. Publishes are
//! serialized by the connection manager.
//!
//! # Cancellation
//!
//! A timeout or cancellation only ends the local wait. The remote invocation
//! still runs and its reply is discarded on arrival.

mod pending;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{self, ErrorReply, ERROR_CONTENT_TYPE};
use crate::connection::{ConnectionHooks, ConnectionManager, ConnectionState};
use crate::transport::{spawn_consumer, TransportConsumer};
use crate::{
    // ---
    log_debug,
    log_info,
    ConnectorPtr,
    CorrelationId,
    Envelope,
    QueueSpec,
    Result,
    RpcConfig,
    RpcError,
    ShutdownEvent,
    TransportPtr,
};

use pending::{Outcome, PendingCalls};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is the pending-call map (correlation id → oneshot
/// sender) and the reply consumer handle. There are no invariants spanning
/// multiple fields; the worst outcome of a poisoned lock is a dropped reply.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed). The broker connection is opened
/// by the first call, or eagerly by [`connect`](Self::connect).
///
/// # Example
///
/// ```no_run
/// use amqp_rpc::{RpcClient, RpcConfig};
/// use serde_json::{json, Value};
///
/// # async fn example() -> amqp_rpc::Result<()> {
/// let client = RpcClient::from_config(RpcConfig::from_env()?)?;
/// let reply: Value = client.request("Echo", &json!({"x": 1})).await?;
/// assert_eq!(reply, json!({"x": 1}));
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    me: Weak<Inner>,
    config: RpcConfig,
    exchange: Arc<str>,
    manager: Arc<ConnectionManager>,
    pending: Mutex<PendingCalls>,
    reply_route: RwLock<Option<ReplyRoute>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a client that connects through `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if `config` is invalid.
    pub fn new(connector: ConnectorPtr, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
            let hooks: Weak<dyn ConnectionHooks> = me.clone();
            Inner {
                me: me.clone(),
                exchange: config.exchange.as_str().into(),
                manager: ConnectionManager::new(connector, &config, hooks),
                pending: Mutex::new(PendingCalls::new()),
                reply_route: RwLock::new(None),
                consumer: Mutex::new(None),
                config,
            }
        });

        Ok(Self { inner })
    }

    /// Create a client for the broker named by `config.broker_uri`.
    pub fn from_config(config: RpcConfig) -> Result<Self> {
        let connector = crate::create_connector(&config)?;
        Self::new(connector, config)
    }

    /// Connect now instead of on the first call.
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectTimeout`] if the broker stays unreachable for the
    /// whole connect budget.
    pub async fn connect(&self) -> Result<()> {
        self.inner.manager.start().await
    }

    /// Call `method` with a raw payload, waiting at most `timeout` for the reply.
    ///
    /// Connecting does not count against `timeout`; it has its own budget.
    ///
    /// # Errors
    ///
    /// - [`RpcError::CallTimeout`] if no reply arrived in time
    /// - [`RpcError::ConnectTimeout`] if no connection could be established
    /// - [`RpcError::UnknownMethod`] / [`RpcError::Remote`] for error replies
    pub async fn call(&self, method: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        let (guard, rx) = self.send(method, payload).await?;

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(received) => received.unwrap_or(Err(RpcError::Shutdown)),
            Err(_) => {
                log_debug!("call {method} ({}) timed out after {timeout:?}", guard.id);
                Err(RpcError::CallTimeout)
            }
        };
        drop(guard);
        outcome
    }

    /// Call `method`, giving up with [`RpcError::CallCancelled`] when `cancel`
    /// completes first.
    pub async fn call_until<F>(&self, method: &str, payload: Bytes, cancel: F) -> Result<Bytes>
    where
        F: Future<Output = ()>,
    {
        // ---
        let (guard, rx) = self.send(method, payload).await?;

        let outcome = tokio::select! {
            received = rx => received.unwrap_or(Err(RpcError::Shutdown)),
            _ = cancel => {
                log_debug!("call {method} ({}) cancelled", guard.id);
                Err(RpcError::CallCancelled)
            }
        };
        drop(guard);
        outcome
    }

    /// Typed call using the configured call timeout.
    pub async fn request<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        // ---
        let body = codec::encode(req)?;
        let reply = self.call(method, body, self.inner.config.call_timeout).await?;
        codec::decode(&reply)
    }

    /// Typed call of a parameterless method using the configured call timeout.
    ///
    /// A void method's empty reply decodes as `()` or `None`.
    pub async fn request_no_params<Resp>(&self, method: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        // ---
        let reply = self
            .call(method, Bytes::new(), self.inner.config.call_timeout)
            .await?;
        codec::decode(&reply)
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Name of the current reply queue, if connected.
    pub fn reply_queue(&self) -> Option<Arc<str>> {
        self.inner.reply_queue()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.subscribe_state()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.manager.reconnect_count()
    }

    /// Close the connection. Waiting calls fail with [`RpcError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        // ---
        let result = self.inner.manager.stop().await;
        self.inner.set_reply_route(None);

        if let Some(consumer) = lock_ignore_poison(&self.inner.consumer).take() {
            consumer.abort();
        }
        let failed = lock_ignore_poison(&self.inner.pending).fail_all(|| RpcError::Shutdown);
        if failed > 0 {
            log_info!("client closed with {failed} call(s) pending");
        }
        result
    }

    /// Register a pending call and publish the request.
    async fn send(
        &self,
        method: &str,
        payload: Bytes,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Outcome>)> {
        // ---
        let (transport, reply_to) = self.route().await?;

        let (id, rx) = lock_ignore_poison(&self.inner.pending).register();
        let guard = PendingGuard {
            inner: self.inner.as_ref(),
            id,
        };

        let env = Envelope::request(
            self.inner.exchange.clone(),
            method.into(),
            guard.id.as_shared(),
            reply_to,
            payload,
        );
        self.inner.manager.publish_on(&transport, env).await?;

        log_debug!("call {method} ({}) published", guard.id);
        Ok((guard, rx))
    }

    /// The live session and the reply queue declared on it.
    ///
    /// A session can drop between connecting and reading the route; one more
    /// round picks up its replacement.
    async fn route(&self) -> Result<(TransportPtr, Arc<str>)> {
        // ---
        for _ in 0..2 {
            let transport = self.inner.manager.ensure_connected().await?;
            if let Some(queue) = self.inner.reply_queue_on(&transport) {
                return Ok((transport, queue));
            }
        }
        Err(RpcError::NotConnected)
    }
}

/// Removes a call's pending entry on every exit path.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_ignore_poison(&self.inner.pending).remove(&self.id);
    }
}

/// Reply queue plus the session it lives on.
#[derive(Clone)]
struct ReplyRoute {
    transport: TransportPtr,
    queue: Arc<str>,
}

impl Inner {
    fn reply_route(&self) -> Option<ReplyRoute> {
        // ---
        match self.reply_route.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn reply_queue(&self) -> Option<Arc<str>> {
        self.reply_route().map(|route| route.queue)
    }

    /// The reply queue, if it was declared on `transport`.
    fn reply_queue_on(&self, transport: &TransportPtr) -> Option<Arc<str>> {
        // ---
        self.reply_route()
            .filter(|route| Arc::ptr_eq(&route.transport, transport))
            .map(|route| route.queue)
    }

    fn set_reply_route(&self, route: Option<ReplyRoute>) {
        // ---
        match self.reply_route.write() {
            Ok(mut guard) => *guard = route,
            Err(poisoned) => *poisoned.into_inner() = route,
        }
    }

    /// Match one reply envelope to its pending call.
    fn handle_reply(&self, env: Envelope) -> Result<()> {
        // ---
        let id: CorrelationId = env
            .correlation_id
            .clone()
            .ok_or_else(|| RpcError::InvalidReply("reply without correlation id".into()))?
            .into();

        let outcome = if env.content_type.as_deref() == Some(ERROR_CONTENT_TYPE) {
            match codec::decode::<ErrorReply>(&env.body) {
                Ok(reply) => Err(reply.into_error()),
                Err(e) => Err(RpcError::InvalidReply(format!("undecodable error reply: {e}"))),
            }
        } else {
            Ok(env.body)
        };

        match lock_ignore_poison(&self.pending).complete(&id, outcome) {
            Some(waited) => log_debug!("reply for {id} after {waited:?}"),
            None => log_debug!("dropping reply for unknown correlation id {id}"),
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConnectionHooks for Inner {
    async fn on_connected(&self, transport: &TransportPtr, reconnected: bool) -> Result<()> {
        // ---
        transport.declare_exchange(&self.config.exchange).await?;
        let queue = transport.declare_queue(&QueueSpec::private()).await?;
        let subscription = transport.consume(&queue).await?;

        let consumer = Arc::new(ReplyConsumer {
            client: self.me.clone(),
            name: format!("{} replies", self.config.connection_name),
        });
        let task = spawn_consumer(subscription, consumer);
        if let Some(previous) = lock_ignore_poison(&self.consumer).replace(task) {
            previous.abort();
        }

        log_info!(
            "{}: reply queue {queue} ready{}",
            self.config.connection_name,
            if reconnected { " after reconnect" } else { "" }
        );
        self.set_reply_route(Some(ReplyRoute {
            transport: transport.clone(),
            queue,
        }));
        Ok(())
    }

    async fn on_disconnected(&self, _event: &ShutdownEvent) {
        self.set_reply_route(None);
    }
}

/// Feeds the reply queue into the client without keeping it alive.
struct ReplyConsumer {
    client: Weak<Inner>,
    name: String,
}

#[async_trait::async_trait]
impl TransportConsumer for ReplyConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_envelope(&self, env: Envelope) -> Result<()> {
        // ---
        match self.client.upgrade() {
            Some(client) => client.handle_reply(env),
            None => Ok(()),
        }
    }
}
