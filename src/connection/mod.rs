//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns the one live broker session of a client or
//! server. It
//!
//! - connects with bounded retry (see [`retry`]),
//! - serializes every publish made through it,
//! - watches the session's shutdown signal and, on an unexpected shutdown,
//!   reconnects and replays setup through [`ConnectionHooks`].
//!
//! ## State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Reconnecting -> Connecting -> Connected   (unexpected shutdown)
//! Connecting -> Disconnected                             (retry budget exhausted)
//! ```
//!
//! A local `stop()` is an `Application` shutdown and never triggers a
//! reconnect. Stopping is permanent for a manager.
//!
//! ## Hooks
//!
//! The owner receives `on_disconnected`, then `on_reconnecting`, then
//! `on_connected(reconnected = true)` for every recovery, and
//! `on_connected(reconnected = false)` for the first successful connect.
//! `on_connected` runs before the session is published to other callers, so
//! nobody observes a session whose queues and bindings are not yet set up.

mod retry;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    ConnectRetry,
    ConnectorPtr,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    ShutdownEvent,
    TransportPtr,
};

use retry::connect_with_retry;

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle callbacks for the owner of a [`ConnectionManager`].
///
/// Implementations must be idempotent with respect to broker resources:
/// re-declaring a queue, exchange or binding that already exists is fine.
#[async_trait::async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// Set up queues, consumers and bindings on a freshly opened session.
    ///
    /// An error closes the session and fails the connect.
    async fn on_connected(&self, transport: &TransportPtr, reconnected: bool) -> Result<()>;

    /// The current session ended unexpectedly.
    async fn on_disconnected(&self, _event: &ShutdownEvent) {}

    /// A reconnect is about to start.
    async fn on_reconnecting(&self) {}
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns the broker session of one client or server.
pub struct ConnectionManager {
    // ---
    me: Weak<ConnectionManager>,
    connector: ConnectorPtr,
    retry: ConnectRetry,
    name: String,
    hooks: Weak<dyn ConnectionHooks>,

    state: watch::Sender<ConnectionState>,
    stop: watch::Sender<bool>,
    current: RwLock<Option<TransportPtr>>,

    // Held for the whole connect sequence, including hooks.
    connect_lock: tokio::sync::Mutex<()>,
    // Publishes through one session never interleave.
    publish_lock: tokio::sync::Mutex<()>,

    ever_connected: AtomicBool,
    reconnects: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager that reports to `hooks`.
    ///
    /// Nothing connects until [`start`](Self::start),
    /// [`ensure_connected`](Self::ensure_connected) or
    /// [`publish`](Self::publish) is called.
    pub fn new(
        connector: ConnectorPtr,
        config: &RpcConfig,
        hooks: Weak<dyn ConnectionHooks>,
    ) -> Arc<Self> {
        // ---
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop, _) = watch::channel(false);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            retry: config.connect_retry.clone(),
            name: config.connection_name.clone(),
            hooks,
            state,
            stop,
            current: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
            ever_connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            supervisor: Mutex::new(None),
        })
    }

    /// Connect, waiting until connected or the retry budget is exhausted.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ConnectTimeout`] when the broker stayed unreachable
    /// - [`RpcError::Shutdown`] when [`stop`](Self::stop) was called
    /// - any error from `on_connected`
    pub async fn start(&self) -> Result<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Return the live session, connecting first if there is none.
    ///
    /// Concurrent callers share one connect attempt. A session that has
    /// already shut down is recovered here if the supervisor has not got to
    /// it yet, with the same hook sequence.
    pub async fn ensure_connected(&self) -> Result<TransportPtr> {
        // ---
        if let Some(transport) = self.transport() {
            if transport.is_open() {
                return Ok(transport);
            }
            return self.recover(transport, None).await;
        }
        if self.is_stopping() {
            return Err(RpcError::Shutdown);
        }

        let guard = self.connect_lock.lock().await;
        match self.transport() {
            Some(transport) if transport.is_open() => Ok(transport),
            Some(lost) => {
                drop(guard);
                self.recover(lost, None).await
            }
            None => {
                let reconnected = self.ever_connected.load(Ordering::Acquire);
                self.connect_locked(reconnected).await
            }
        }
    }

    /// Publish through the live session, connecting first if needed.
    pub async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let transport = self.ensure_connected().await?;
        self.publish_on(&transport, env).await
    }

    /// Publish through `transport`, serialized with every other publish.
    ///
    /// Callers that built `env` for a particular session (its reply queue,
    /// say) use this so the envelope cannot leave through a newer one.
    pub async fn publish_on(&self, transport: &TransportPtr, env: Envelope) -> Result<()> {
        // ---
        let _guard = self.publish_lock.lock().await;
        transport.publish(env).await
    }

    /// Close the session and stop reconnecting.
    ///
    /// An in-progress connect attempt is abandoned with
    /// [`RpcError::Shutdown`].
    pub async fn stop(&self) -> Result<()> {
        // ---
        self.stop.send_replace(true);

        if let Some(supervisor) = lock_ignore_poison(&self.supervisor).take() {
            supervisor.abort();
        }

        let transport = self.take_current();
        self.set_state(ConnectionState::Disconnected);

        if let Some(transport) = transport {
            log_info!("{}: closing {}", self.name, transport.transport_id());
            transport.close().await?;
        }
        Ok(())
    }

    /// The live session, if connected.
    pub fn transport(&self) -> Option<TransportPtr> {
        // ---
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of completed reconnects after unexpected shutdowns.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        // ---
        let previous = self.state.send_replace(next);
        if previous != next {
            log_debug!("{}: {previous} -> {next}", self.name);
        }
    }

    fn take_current(&self) -> Option<TransportPtr> {
        // ---
        match self.current.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Run the connect sequence. Caller holds `connect_lock`.
    async fn connect_locked(&self, reconnected: bool) -> Result<TransportPtr> {
        // ---
        self.set_state(ConnectionState::Connecting);

        let transport = match connect_with_retry(
            self.connector.as_ref(),
            &self.name,
            &self.retry,
            &self.stop.subscribe(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(err) => {
                log_error!("{}: connect failed: {err}", self.name);
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        if let Some(hooks) = self.hooks.upgrade() {
            if let Err(err) = hooks.on_connected(&transport, reconnected).await {
                log_error!("{}: session setup failed: {err}", self.name);
                let _ = transport.close().await;
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        }

        let stopped = {
            let mut current = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // stop() raises the flag before it takes `current`, so checking
            // under the lock closes the race with a concurrent stop. The
            // state is published under the same lock for the same reason.
            let stopped = self.is_stopping();
            if !stopped {
                *current = Some(transport.clone());
                self.set_state(ConnectionState::Connected);
            }
            stopped
        };
        if stopped {
            let _ = transport.close().await;
            return Err(RpcError::Shutdown);
        }

        self.ever_connected.store(true, Ordering::Release);
        self.spawn_supervisor(transport.clone());

        log_info!(
            "{}: connected ({}{})",
            self.name,
            transport.transport_id(),
            if reconnected { ", reconnected" } else { "" }
        );
        Ok(transport)
    }

    fn spawn_supervisor(&self, transport: TransportPtr) {
        // ---
        let me = self.me.clone();
        let mut signal = transport.shutdown_signal();

        let handle = tokio::spawn(async move {
            let event = loop {
                if let Some(event) = signal.borrow_and_update().clone() {
                    break event;
                }
                if signal.changed().await.is_err() {
                    return;
                }
            };
            if let Some(manager) = me.upgrade() {
                manager.handle_shutdown(transport, event).await;
            }
        });

        // The previous supervisor (if any) has finished, or is the task
        // running this reconnect; it must not be aborted here.
        *lock_ignore_poison(&self.supervisor) = Some(handle);
    }

    async fn handle_shutdown(&self, transport: TransportPtr, event: ShutdownEvent) {
        // ---
        if !event.is_unexpected() || self.is_stopping() {
            log_debug!("{}: session closed ({event})", self.name);
            return;
        }
        if let Err(err) = self.recover(transport, Some(event)).await {
            log_error!("{}: reconnect failed: {err}", self.name);
        }
    }

    /// Replace the shut-down session `lost` with a new one.
    ///
    /// Runs entirely under `connect_lock`: whoever gets there first clears
    /// the session and runs `on_disconnected`, `on_reconnecting` and
    /// `on_connected(true)` in that order; later arrivals find the
    /// replacement and return it.
    async fn recover(
        &self,
        lost: TransportPtr,
        event: Option<ShutdownEvent>,
    ) -> Result<TransportPtr> {
        // ---
        let _guard = self.connect_lock.lock().await;
        if self.is_stopping() {
            return Err(RpcError::Shutdown);
        }

        let cleared = {
            let mut current = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match current.as_ref() {
                Some(live) if Arc::ptr_eq(live, &lost) => {
                    *current = None;
                    true
                }
                Some(live) => return Ok(live.clone()),
                None => false,
            }
        };

        if !cleared {
            // An earlier recovery already ran the hooks and then gave up.
            return self.connect_locked(true).await;
        }

        let event = match event {
            Some(event) => event,
            None => {
                let signal = lost.shutdown_signal();
                let seen = signal.borrow().clone();
                seen.unwrap_or_else(|| ShutdownEvent::library("session closed"))
            }
        };

        log_warn!("{}: connection lost ({event}), reconnecting", self.name);
        self.set_state(ConnectionState::Reconnecting);

        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_disconnected(&event).await;
            hooks.on_reconnecting().await;
        }

        let transport = self.connect_locked(true).await?;
        self.reconnects.fetch_add(1, Ordering::AcqRel);
        Ok(transport)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // ---
        if let Some(supervisor) = lock_ignore_poison(&self.supervisor).take() {
            supervisor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{MemoryHub, QueueSpec};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ConnectionHooks for Recorder {
        async fn on_connected(&self, transport: &TransportPtr, reconnected: bool) -> Result<()> {
            // ---
            transport.declare_queue(&QueueSpec::private()).await?;
            self.events
                .lock()
                .unwrap()
                .push(format!("connected(reconnected={reconnected})"));
            Ok(())
        }

        async fn on_disconnected(&self, _event: &ShutdownEvent) {
            self.events.lock().unwrap().push("disconnected".into());
        }

        async fn on_reconnecting(&self) {
            self.events.lock().unwrap().push("reconnecting".into());
        }
    }

    fn manager(hub: &Arc<MemoryHub>, hooks: &Arc<Recorder>) -> Arc<ConnectionManager> {
        // ---
        let weak: Weak<Recorder> = Arc::downgrade(hooks);
        let hooks: Weak<dyn ConnectionHooks> = weak;
        let config = RpcConfig::memory("rpc")
            .with_connect_timeout(Duration::from_secs(30))
            .with_connect_retry_interval(Duration::from_secs(5));
        ConnectionManager::new(hub.connector(), &config, hooks)
    }

    async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
        // ---
        let mut states = manager.subscribe_state();
        states.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_connects_once() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.start().await.unwrap();
        manager.start().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(hooks.events(), vec!["connected(reconnected=false)"]);
        assert_eq!(hub.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_connect() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);

        let (a, b) = tokio::join!(manager.ensure_connected(), manager.ensure_connected());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(hub.total_connects(), 1);
    }

    async fn wait_for_reconnects(manager: &ConnectionManager, wanted: u64) {
        // ---
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.reconnect_count() < wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect did not complete");
    }

    #[tokio::test]
    async fn test_unexpected_shutdown_reconnects_with_hooks() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);
        manager.start().await.unwrap();

        hub.disconnect_all();

        // The whole recovery can finish before this task runs again, so
        // wait on the counter rather than on a transient state.
        wait_for_reconnects(&manager, 1).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            hooks.events(),
            vec![
                "connected(reconnected=false)",
                "disconnected",
                "reconnecting",
                "connected(reconnected=true)",
            ]
        );
        assert_eq!(manager.reconnect_count(), 1);
        assert_eq!(hub.open_connections(), 1);
    }

    /// Tracks reply-queue style state: set on connect, wiped on disconnect.
    #[derive(Default)]
    struct SlowTeardown {
        events: Mutex<Vec<String>>,
        queue: Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl ConnectionHooks for SlowTeardown {
        async fn on_connected(&self, transport: &TransportPtr, reconnected: bool) -> Result<()> {
            // ---
            let queue = transport.declare_queue(&QueueSpec::private()).await?;
            *self.queue.lock().unwrap() = Some(queue.to_string());
            self.events
                .lock()
                .unwrap()
                .push(format!("connected(reconnected={reconnected})"));
            Ok(())
        }

        async fn on_disconnected(&self, _event: &ShutdownEvent) {
            // ---
            tokio::time::sleep(Duration::from_millis(100)).await;
            *self.queue.lock().unwrap() = None;
            self.events.lock().unwrap().push("disconnected".into());
        }

        async fn on_reconnecting(&self) {
            self.events.lock().unwrap().push("reconnecting".into());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_caller_during_slow_disconnect_hook_keeps_hook_order() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(SlowTeardown::default());
        let weak: Weak<SlowTeardown> = Arc::downgrade(&hooks);
        let dyn_hooks: Weak<dyn ConnectionHooks> = weak;
        let config = RpcConfig::memory("rpc");
        let manager = ConnectionManager::new(hub.connector(), &config, dyn_hooks);
        manager.start().await.unwrap();

        hub.disconnect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Arrives while on_disconnected is still sleeping.
        let transport = manager.ensure_connected().await.unwrap();
        assert!(transport.is_open());

        wait_for_reconnects(&manager, 1).await;
        assert_eq!(
            hooks.events.lock().unwrap().clone(),
            vec![
                "connected(reconnected=false)",
                "disconnected",
                "reconnecting",
                "connected(reconnected=true)",
            ]
        );
        assert!(hooks.queue.lock().unwrap().is_some());
        assert_eq!(hub.total_connects(), 2);
        assert_eq!(hub.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_caller_recovers_closed_session_before_supervisor() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);
        let first = manager.ensure_connected().await.unwrap();

        // No await between the disconnect and the call: the supervisor has
        // not run yet.
        hub.disconnect_all();
        let second = manager.ensure_connected().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());
        assert_eq!(manager.reconnect_count(), 1);

        // The supervisor of the lost session finds it already replaced.
        tokio::task::yield_now().await;
        assert_eq!(manager.reconnect_count(), 1);
        assert_eq!(hub.total_connects(), 2);
        assert_eq!(
            hooks.events(),
            vec![
                "connected(reconnected=false)",
                "disconnected",
                "reconnecting",
                "connected(reconnected=true)",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_for_broker() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);
        manager.start().await.unwrap();

        hub.set_reachable(false);
        hub.disconnect_all();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        hub.set_reachable(true);
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_does_not_reconnect() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);
        manager.start().await.unwrap();

        manager.stop().await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(hub.open_connections(), 0);
        assert_eq!(hooks.events(), vec!["connected(reconnected=false)"]);
        assert!(matches!(manager.start().await, Err(RpcError::Shutdown)));
    }

    /// Stops its own manager from inside `on_connected`.
    #[derive(Default)]
    struct StopOnConnect {
        manager: std::sync::OnceLock<Weak<ConnectionManager>>,
    }

    #[async_trait::async_trait]
    impl ConnectionHooks for StopOnConnect {
        async fn on_connected(&self, _transport: &TransportPtr, _reconnected: bool) -> Result<()> {
            // ---
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                manager.stop().await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_during_connect_stays_disconnected() {
        // ---
        let hub = MemoryHub::new();
        let hooks = Arc::new(StopOnConnect::default());
        let weak: Weak<StopOnConnect> = Arc::downgrade(&hooks);
        let dyn_hooks: Weak<dyn ConnectionHooks> = weak;
        let manager = ConnectionManager::new(hub.connector(), &RpcConfig::memory("rpc"), dyn_hooks);
        hooks.manager.set(Arc::downgrade(&manager)).unwrap();

        let result = manager.start().await;

        assert!(matches!(result, Err(RpcError::Shutdown)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.transport().is_none());
        assert_eq!(hub.open_connections(), 0);
        assert!(matches!(manager.start().await, Err(RpcError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_times_out() {
        // ---
        let hub = MemoryHub::new();
        hub.set_reachable(false);
        let hooks = Arc::new(Recorder::default());
        let manager = manager(&hub, &hooks);

        let started = tokio::time::Instant::now();
        let result = manager.start().await;

        assert!(matches!(result, Err(RpcError::ConnectTimeout(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(hooks.events().is_empty());
    }
}
