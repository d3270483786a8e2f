//! In-memory transport implementation.
//!
//! This module provides a pure in-process broker implementing the domain
//! `Connector` and `Transport` traits. It is intended for testing, local
//! execution, and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Exchanges are direct-routed: a message reaches every queue bound with
//!   exactly its routing key.
//! - The default exchange (`""`) routes to the queue named by the routing key;
//!   a message for a missing queue is dropped, as a broker would.
//! - Publishing to an undeclared exchange is an error.
//! - A queue with several consumers hands messages out round-robin; a queue
//!   with none keeps a backlog that the next consumer receives.
//! - Exclusive queues belong to the declaring connection and are deleted, with
//!   their bindings, when it closes or is dropped by the broker.
//! - Declarations are idempotent.
//!
//! ## Failure simulation
//!
//! [`MemoryHub::set_reachable`] makes new connects fail with
//! `BrokerUnreachable`, and [`MemoryHub::disconnect_all`] drops every live
//! connection with a peer-initiated shutdown, the way a broker restart would.
//! [`MemoryHub::disconnect`] drops only the connections opened under one
//! connection name.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_info,
    Connector,
    ConnectorPtr,
    Envelope,
    QueueSpec,
    Result,
    RpcError,
    ShutdownEvent,
    ShutdownNotifier,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
};

type ConnectionId = u64;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct MemoryQueue {
    owner: Option<ConnectionId>,
    auto_delete: bool,
    bindings: HashSet<(String, String)>,
    backlog: VecDeque<Envelope>,
    consumers: Vec<mpsc::UnboundedSender<Envelope>>,
    next_consumer: usize,
    ever_consumed: bool,
}

impl MemoryQueue {
    fn new(owner: Option<ConnectionId>, auto_delete: bool) -> Self {
        Self {
            owner,
            auto_delete,
            bindings: HashSet::new(),
            backlog: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            ever_consumed: false,
        }
    }

    /// Hand `env` to the next live consumer, or keep it in the backlog.
    fn deliver(&mut self, mut env: Envelope) {
        // ---
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].send(env) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver dropped; forget the consumer and try the next.
                    self.consumers.remove(idx);
                    env = returned;
                }
            }
        }
        self.backlog.push_back(env);
    }

    fn has_live_consumer(&mut self) -> bool {
        self.consumers.retain(|tx| !tx.is_closed());
        !self.consumers.is_empty()
    }
}

struct LiveConnection {
    name: String,
    notifier: ShutdownNotifier,
}

#[derive(Default)]
struct HubState {
    unreachable: bool,
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    connections: HashMap<ConnectionId, LiveConnection>,
    next_connection: ConnectionId,
    next_queue: u64,
    total_connects: u64,
}

impl HubState {
    fn drop_connection(&mut self, id: ConnectionId) {
        // ---
        self.connections.remove(&id);
        // Dropping the queue drops its consumer senders, which ends the
        // consumers' inboxes.
        self.queues.retain(|_, q| q.owner != Some(id));
    }

    fn reap_auto_delete(&mut self) {
        self.queues
            .retain(|_, q| !(q.auto_delete && q.ever_consumed && !q.has_live_consumer()));
    }
}

/// Shared in-process broker.
///
/// All connectors created from the same hub see the same exchanges and
/// queues, exactly as processes connected to one broker would. Create one hub
/// per test for isolation.
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Create a connector bound to this hub.
    pub fn connector(self: &Arc<Self>) -> ConnectorPtr {
        Arc::new(MemoryConnector { hub: self.clone() })
    }

    /// Make subsequent connects succeed (`true`) or fail as unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        lock_ignore_poison(&self.state).unreachable = !reachable;
    }

    /// Drop every live connection as if the broker had closed them.
    ///
    /// Returns the number of connections dropped.
    pub fn disconnect_all(&self) -> usize {
        self.force_close(|_| true)
    }

    /// Drop the live connections opened under `connection_name`.
    ///
    /// Returns the number of connections dropped.
    pub fn disconnect(&self, connection_name: &str) -> usize {
        self.force_close(|conn| conn.name == connection_name)
    }

    fn force_close(&self, selected: impl Fn(&LiveConnection) -> bool) -> usize {
        // ---
        let notifiers: Vec<ShutdownNotifier> = {
            let mut state = lock_ignore_poison(&self.state);
            let ids: Vec<ConnectionId> = state
                .connections
                .iter()
                .filter(|(_, conn)| selected(conn))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let notifier = state.connections.get(&id).map(|c| c.notifier.clone());
                    state.drop_connection(id);
                    notifier
                })
                .collect()
        };

        log_info!("memory hub: dropping {} connection(s)", notifiers.len());
        for notifier in &notifiers {
            notifier.notify(ShutdownEvent::peer("connection forced closed by broker"));
        }
        notifiers.len()
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        lock_ignore_poison(&self.state).connections.len()
    }

    /// Number of successful connects since the hub was created.
    pub fn total_connects(&self) -> u64 {
        lock_ignore_poison(&self.state).total_connects
    }

    /// Routing keys bound from `exchange` to `queue`.
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        // ---
        let state = lock_ignore_poison(&self.state);
        let mut keys: Vec<String> = state
            .queues
            .get(queue)
            .map(|q| {
                q.bindings
                    .iter()
                    .filter(|(ex, _)| ex == exchange)
                    .map(|(_, key)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Names of all queues bound to `exchange` with `routing_key`.
    pub fn queues_bound_to(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        // ---
        let state = lock_ignore_poison(&self.state);
        let wanted = (exchange.to_string(), routing_key.to_string());
        let mut names: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.bindings.contains(&wanted))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    fn open(&self, name: &str) -> Result<(ConnectionId, ShutdownNotifier, TransportBase)> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.unreachable {
            return Err(RpcError::BrokerUnreachable(
                "memory hub is not accepting connections".into(),
            ));
        }

        state.next_connection += 1;
        state.total_connects += 1;
        let id = state.next_connection;

        let base = TransportBase::new(format!("memory-{id}"));
        let notifier = base.shutdown_notifier();
        state.connections.insert(
            id,
            LiveConnection {
                name: name.to_string(),
                notifier: notifier.clone(),
            },
        );

        Ok((id, notifier, base))
    }

    fn with_live_connection<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut HubState) -> Result<T>,
    ) -> Result<T> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if !state.connections.contains_key(&id) {
            return Err(RpcError::Transport("connection is closed".into()));
        }
        f(&mut state)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
        }
    }
}

/// Process-global hub used for `memory://` URIs.
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

pub(crate) fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// Opens sessions on a [`MemoryHub`].
pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

impl MemoryConnector {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, connection_name: &str) -> Result<TransportPtr> {
        // ---
        let (id, notifier, base) = self.hub.open(connection_name)?;
        log_debug!("{connection_name}: opened {}", base.transport_id);

        Ok(Arc::new(MemoryTransport {
            base,
            id,
            hub: self.hub.clone(),
            notifier,
        }))
    }
}

/// One session on a [`MemoryHub`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    id: ConnectionId,
    hub: Arc<MemoryHub>,
    notifier: ShutdownNotifier,
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        // ---
        // A session dropped without close() goes away like a dead TCP link.
        lock_ignore_poison(&self.hub.state).drop_connection(self.id);
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        // ---
        self.hub.with_live_connection(self.id, |state| {
            if exchange.is_empty() {
                return Err(RpcError::Transport(
                    "cannot redeclare the default exchange".into(),
                ));
            }
            state.exchanges.insert(exchange.to_string());
            Ok(())
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<Arc<str>> {
        // ---
        let id = self.id;
        self.hub.with_live_connection(id, |state| {
            let name = match &spec.name {
                Some(name) => name.clone(),
                None => {
                    state.next_queue += 1;
                    format!("amq.gen-{}-{}", id, state.next_queue)
                }
            };

            let owner = spec.exclusive.then_some(id);
            match state.queues.get(&name) {
                Some(existing) if existing.owner.is_some() && existing.owner != Some(id) => {
                    return Err(RpcError::Transport(format!(
                        "queue '{name}' is locked by another connection"
                    )));
                }
                Some(_) => {}
                None => {
                    state
                        .queues
                        .insert(name.clone(), MemoryQueue::new(owner, spec.auto_delete));
                }
            }
            Ok(Arc::from(name))
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.hub.with_live_connection(self.id, |state| {
            if !state.exchanges.contains(exchange) {
                return Err(RpcError::Transport(format!(
                    "no exchange '{exchange}' to bind to"
                )));
            }
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| RpcError::Transport(format!("no queue '{queue}'")))?;
            q.bindings
                .insert((exchange.to_string(), routing_key.to_string()));
            Ok(())
        })
    }

    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle> {
        // ---
        self.hub.with_live_connection(self.id, |state| {
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| RpcError::Transport(format!("no queue '{queue}'")))?;

            let (tx, rx) = mpsc::unbounded_channel();
            q.consumers.push(tx);
            q.ever_consumed = true;

            // Flush anything published before the consumer existed.
            while let Some(env) = q.backlog.pop_front() {
                q.deliver(env);
            }

            Ok(SubscriptionHandle { inbox: rx })
        })
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        self.hub.with_live_connection(self.id, |state| {
            state.reap_auto_delete();

            if env.is_default_exchange() {
                match state.queues.get_mut(env.routing_key.as_ref()) {
                    Some(q) => q.deliver(env),
                    None => {
                        log_debug!("memory hub: no queue '{}', message dropped", env.routing_key);
                    }
                }
                return Ok(());
            }

            if !state.exchanges.contains(env.exchange.as_ref()) {
                return Err(RpcError::Transport(format!(
                    "no exchange '{}'",
                    env.exchange
                )));
            }

            let key = (env.exchange.to_string(), env.routing_key.to_string());
            let targets: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.bindings.contains(&key))
                .map(|(name, _)| name.clone())
                .collect();

            if targets.is_empty() {
                log_debug!(
                    "memory hub: '{}' has no route for '{}', message dropped",
                    env.exchange,
                    env.routing_key
                );
            }
            for name in targets {
                if let Some(q) = state.queues.get_mut(&name) {
                    q.deliver(env.clone());
                }
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.hub.state);
            state.drop_connection(self.id);
        }
        self.notifier
            .notify(ShutdownEvent::application("closed by application"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use crate::ShutdownInitiator;

    fn request(exchange: &str, key: &str) -> Envelope {
        Envelope::request(
            exchange.into(),
            key.into(),
            "c-1".into(),
            "reply".into(),
            Bytes::from_static(b"{}"),
        )
    }

    #[tokio::test]
    async fn test_direct_routing_by_exact_key() {
        // ---
        let hub = MemoryHub::new();
        let t = hub.connector().connect("test").await.unwrap();

        t.declare_exchange("rpc").await.unwrap();
        let queue = t.declare_queue(&QueueSpec::private()).await.unwrap();
        t.bind_queue(&queue, "rpc", "Echo").await.unwrap();
        let mut sub = t.consume(&queue).await.unwrap();

        t.publish(request("rpc", "Other")).await.unwrap();
        t.publish(request("rpc", "Echo")).await.unwrap();

        let got = sub.inbox.recv().await.unwrap();
        assert_eq!(&*got.routing_key, "Echo");
        assert!(sub.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        // ---
        let hub = MemoryHub::new();
        let t = hub.connector().connect("test").await.unwrap();

        let queue = t.declare_queue(&QueueSpec::private()).await.unwrap();
        let mut sub = t.consume(&queue).await.unwrap();

        let reply = Envelope::reply(queue.clone(), "c-9".into(), Bytes::new(), "application/json".into());
        t.publish(reply).await.unwrap();

        let got = sub.inbox.recv().await.unwrap();
        assert_eq!(got.correlation_id.as_deref(), Some("c-9"));
    }

    #[tokio::test]
    async fn test_backlog_delivered_to_late_consumer() {
        // ---
        let hub = MemoryHub::new();
        let t = hub.connector().connect("test").await.unwrap();

        let queue = t.declare_queue(&QueueSpec::shared("work")).await.unwrap();
        t.publish(Envelope::reply(queue.clone(), "c-1".into(), Bytes::new(), "x".into()))
            .await
            .unwrap();

        let mut sub = t.consume(&queue).await.unwrap();
        assert!(sub.inbox.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_error() {
        // ---
        let hub = MemoryHub::new();
        let t = hub.connector().connect("test").await.unwrap();
        assert!(matches!(
            t.publish(request("missing", "Echo")).await,
            Err(RpcError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_close_removes_exclusive_queues() {
        // ---
        let hub = MemoryHub::new();
        let t = hub.connector().connect("test").await.unwrap();
        let queue = t.declare_queue(&QueueSpec::private()).await.unwrap();
        let mut sub = t.consume(&queue).await.unwrap();

        t.close().await.unwrap();

        assert!(!hub.queue_exists(&queue));
        assert!(sub.inbox.recv().await.is_none());
        let event = t.shutdown_signal().borrow().clone().unwrap();
        assert_eq!(event.initiator, ShutdownInitiator::Application);
        assert!(t.publish(request("rpc", "Echo")).await.is_err());
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_locked() {
        // ---
        let hub = MemoryHub::new();
        let a = hub.connector().connect("a").await.unwrap();
        let b = hub.connector().connect("b").await.unwrap();

        let spec = QueueSpec {
            name: Some("mine".into()),
            exclusive: true,
            auto_delete: true,
        };
        a.declare_queue(&spec).await.unwrap();
        a.declare_queue(&spec).await.unwrap();
        assert!(b.declare_queue(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_all_signals_peer_shutdown() {
        // ---
        let hub = MemoryHub::new();
        let t = hub.connector().connect("test").await.unwrap();
        let mut signal = t.shutdown_signal();

        assert_eq!(hub.disconnect_all(), 1);
        signal.changed().await.unwrap();

        let event = signal.borrow().clone().unwrap();
        assert!(event.is_unexpected());
        assert!(!t.is_open());
        assert_eq!(hub.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_by_name_leaves_others_open() {
        // ---
        let hub = MemoryHub::new();
        let caller = hub.connector().connect("caller").await.unwrap();
        let other = hub.connector().connect("other").await.unwrap();

        assert_eq!(hub.disconnect("caller"), 1);
        assert!(!caller.is_open());
        assert!(other.is_open());
        assert_eq!(hub.open_connections(), 1);
        assert_eq!(hub.disconnect("caller"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_hub() {
        // ---
        let hub = MemoryHub::new();
        hub.set_reachable(false);
        assert!(matches!(
            hub.connector().connect("test").await,
            Err(RpcError::BrokerUnreachable(_))
        ));

        hub.set_reachable(true);
        assert!(hub.connector().connect("test").await.is_ok());
        assert_eq!(hub.total_connects(), 1);
    }
}
