//! RPC server implementation.
//!
//! The server owns a broker connection, an inbound queue bound to the RPC
//! exchange once per registered method name, and the [`MethodRegistry`] that
//! serves those names.
//!
//! ## Routes
//!
//! Controllers can be registered before or after `start()`. Names registered
//! while connected are bound at once; names registered while disconnected
//! are bound by the next `on_connected`. Every (re)connect binds the full
//! list, so routes survive broker-side recovery. Registration and binding
//! share one lock, so a name can never slip between the two.
//!
//! ## Dispatch
//!
//! Each request runs in its own task, bounded by `max_in_flight`. The reply
//! goes to the request's `reply_to` queue through the default exchange with
//! the same correlation id. Requests without `reply_to` are invoked and their
//! result is discarded.

mod dispatch;

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::{self, ErrorReply, ERROR_CONTENT_TYPE, JSON_CONTENT_TYPE};
use crate::connection::{ConnectionHooks, ConnectionManager, ConnectionState};
use crate::registry::{Controller, InstanceResolver, Instances, MethodRegistry, Singleton};
use crate::transport::{spawn_consumer, TransportConsumer};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    ConnectorPtr,
    Envelope,
    QueueSpec,
    Result,
    RpcConfig,
    ShutdownEvent,
    TransportPtr,
};

use dispatch::Dispatcher;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RPC server serving registered controllers.
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```no_run
/// use amqp_rpc::{Controller, MethodSet, RpcConfig, RpcServer};
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// struct EchoController;
///
/// impl Controller for EchoController {
///     fn methods(methods: &mut MethodSet<Self>) {
///         methods.method("Echo", |_c: Arc<EchoController>, v: Value| async move { Ok(v) });
///     }
/// }
///
/// # async fn example() -> amqp_rpc::Result<()> {
/// let server = RpcServer::from_config(RpcConfig::from_env()?)?;
/// server.register_instance(Arc::new(EchoController)).await?;
/// server.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Binding {
    transport: TransportPtr,
    queue: Arc<str>,
}

#[derive(Default)]
struct Routes {
    names: Vec<String>,
    binding: Option<Binding>,
}

struct Inner {
    // ---
    me: Weak<Inner>,
    config: RpcConfig,
    manager: Arc<ConnectionManager>,
    registry: MethodRegistry,
    instances: Arc<Instances>,
    resolver: RwLock<Arc<dyn InstanceResolver>>,
    routes: tokio::sync::Mutex<Routes>,
    dispatcher: Dispatcher,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Create a server that connects through `connector`.
    ///
    /// Controllers registered with [`register_controller`](Self::register_controller)
    /// are resolved through [`instances`](Self::instances) unless
    /// [`with_resolver`](Self::with_resolver) installs another resolver.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`](crate::RpcError::Config) if `config` is invalid.
    pub fn new(connector: ConnectorPtr, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let instances = Arc::new(Instances::new());
        let default_resolver: Arc<dyn InstanceResolver> = instances.clone();
        let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
            let hooks: Weak<dyn ConnectionHooks> = me.clone();
            Inner {
                me: me.clone(),
                manager: ConnectionManager::new(connector, &config, hooks),
                registry: MethodRegistry::new(),
                resolver: RwLock::new(default_resolver),
                instances,
                routes: tokio::sync::Mutex::new(Routes::default()),
                dispatcher: Dispatcher::new(config.max_in_flight),
                consumer: Mutex::new(None),
                config,
            }
        });

        Ok(Self { inner })
    }

    /// Create a server for the broker named by `config.broker_uri`.
    pub fn from_config(config: RpcConfig) -> Result<Self> {
        let connector = crate::create_connector(&config)?;
        Self::new(connector, config)
    }

    /// Resolve controllers registered from now on through `resolver`.
    pub fn with_resolver(self, resolver: Arc<dyn InstanceResolver>) -> Self {
        // ---
        match self.inner.resolver.write() {
            Ok(mut guard) => *guard = resolver,
            Err(poisoned) => *poisoned.into_inner() = resolver,
        }
        self
    }

    /// The built-in instance container used by the default resolver.
    pub fn instances(&self) -> &Instances {
        &self.inner.instances
    }

    /// Register every method of controller `C`.
    ///
    /// Instances of `C` come from the server's resolver at call time. Returns
    /// the registered method names.
    ///
    /// # Errors
    ///
    /// [`RpcError::DuplicateRegistration`](crate::RpcError::DuplicateRegistration)
    /// if any name is already taken; nothing is registered in that case.
    pub async fn register_controller<C: Controller>(&self) -> Result<Vec<String>> {
        // ---
        let resolver = match self.inner.resolver.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        self.inner.register::<C>(resolver).await
    }

    /// Register every method of controller `C`, served by `instance`.
    pub async fn register_instance<C: Controller>(&self, instance: Arc<C>) -> Result<Vec<String>> {
        self.inner.register::<C>(Arc::new(Singleton(instance))).await
    }

    /// Connect, declare the inbound queue and bind every registered name.
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectTimeout`](crate::RpcError::ConnectTimeout) if the
    /// broker stays unreachable for the whole connect budget.
    pub async fn start(&self) -> Result<()> {
        self.inner.manager.start().await
    }

    /// Stop consuming, let running invocations finish (up to the drain
    /// timeout) and close the connection.
    pub async fn stop(&self) -> Result<()> {
        // ---
        if let Some(consumer) = lock_ignore_poison(&self.inner.consumer).take() {
            consumer.abort();
        }
        self.inner.dispatcher.drain(self.inner.config.drain_timeout).await;

        self.inner.routes.lock().await.binding = None;
        self.inner.manager.stop().await
    }

    /// Names of all registered methods, sorted.
    pub fn registered_methods(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Name of the current inbound queue, if connected.
    pub async fn queue_name(&self) -> Option<Arc<str>> {
        // ---
        let routes = self.inner.routes.lock().await;
        routes.binding.as_ref().map(|b| b.queue.clone())
    }

    /// Number of invocations currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
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
}

impl Inner {
    async fn register<C: Controller>(&self, resolver: Arc<dyn InstanceResolver>) -> Result<Vec<String>> {
        // ---
        let mut routes = self.routes.lock().await;
        let names = self.registry.register::<C>(resolver)?;
        routes.names.extend(names.iter().cloned());

        match &routes.binding {
            Some(binding) => {
                for name in &names {
                    if let Err(err) = binding
                        .transport
                        .bind_queue(&binding.queue, &self.config.exchange, name)
                        .await
                    {
                        // The next reconnect binds the full list again.
                        log_warn!("binding {name} failed, deferred to reconnect: {err}");
                    }
                }
            }
            None => log_debug!("not connected, binding of {names:?} deferred"),
        }
        Ok(names)
    }

    /// Run one request and publish its reply.
    async fn process(&self, env: Envelope) {
        // ---
        let method = env.routing_key.clone();
        let result = self.registry.invoke(&method, env.body).await;

        let (Some(reply_to), Some(correlation_id)) = (env.reply_to, env.correlation_id) else {
            match result {
                Ok(_) => log_debug!("{method}: no reply requested, result discarded"),
                Err(err) => log_warn!("{method} failed (no reply requested): {err}"),
            }
            return;
        };

        let reply = match result {
            Ok(body) => Envelope::reply(reply_to, correlation_id, body, JSON_CONTENT_TYPE.into()),
            Err(err) => {
                log_warn!("{method} failed: {err}");
                if !self.config.reply_on_error {
                    return;
                }
                let body = match codec::encode(&ErrorReply::from_error(&method, &err)) {
                    Ok(body) => body,
                    Err(e) => {
                        log_error!("{method}: cannot encode error reply: {e}");
                        return;
                    }
                };
                Envelope::reply(reply_to, correlation_id, body, ERROR_CONTENT_TYPE.into())
            }
        };

        if let Err(err) = self.manager.publish(reply).await {
            log_warn!("{method}: reply not sent: {err}");
        }
    }
}

#[async_trait::async_trait]
impl ConnectionHooks for Inner {
    async fn on_connected(&self, transport: &TransportPtr, reconnected: bool) -> Result<()> {
        // ---
        let spec = match &self.config.server_queue {
            Some(name) => QueueSpec::shared(name.as_str()),
            None => QueueSpec::private(),
        };
        let queue = transport.declare_queue(&spec).await?;
        transport.declare_exchange(&self.config.exchange).await?;
        let subscription = transport.consume(&queue).await?;

        let consumer = Arc::new(RequestConsumer {
            server: self.me.clone(),
            name: format!("{} requests", self.config.connection_name),
        });
        let task = spawn_consumer(subscription, consumer);
        if let Some(previous) = lock_ignore_poison(&self.consumer).replace(task) {
            previous.abort();
        }

        let mut routes = self.routes.lock().await;
        for name in &routes.names {
            transport
                .bind_queue(&queue, &self.config.exchange, name)
                .await?;
        }
        log_info!(
            "{}: queue {queue} bound for {} method(s){}",
            self.config.connection_name,
            routes.names.len(),
            if reconnected { " after reconnect" } else { "" }
        );
        routes.binding = Some(Binding {
            transport: transport.clone(),
            queue,
        });
        Ok(())
    }

    async fn on_disconnected(&self, _event: &ShutdownEvent) {
        self.routes.lock().await.binding = None;
    }
}

/// Feeds the inbound queue into the dispatcher without keeping the server alive.
struct RequestConsumer {
    server: Weak<Inner>,
    name: String,
}

#[async_trait::async_trait]
impl TransportConsumer for RequestConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_envelope(&self, env: Envelope) -> Result<()> {
        // ---
        let Some(server) = self.server.upgrade() else {
            return Ok(());
        };
        log_debug!("{}: request {}", self.name, env.routing_key);

        let worker = server.clone();
        server
            .dispatcher
            .spawn(async move { worker.process(env).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{MemoryHub, MethodSet};
    use serde_json::Value;

    struct Echo;

    impl Controller for Echo {
        fn methods(methods: &mut MethodSet<Self>) {
            methods.method("Echo", |_c: Arc<Echo>, v: Value| async move { Ok(v) });
        }
    }

    fn server(hub: &Arc<MemoryHub>) -> RpcServer {
        RpcServer::new(hub.connector(), RpcConfig::memory("rpc")).unwrap()
    }

    #[tokio::test]
    async fn test_registration_before_start_is_bound_on_connect() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub);
        server.register_instance(Arc::new(Echo)).await.unwrap();
        assert!(server.queue_name().await.is_none());

        server.start().await.unwrap();

        let queue = server.queue_name().await.unwrap();
        assert_eq!(hub.bindings(&queue, "rpc"), vec!["Echo"]);
    }

    #[tokio::test]
    async fn test_registration_after_start_binds_immediately() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub);
        server.start().await.unwrap();

        let queue = server.queue_name().await.unwrap();
        assert!(hub.bindings(&queue, "rpc").is_empty());

        server.instances().insert(Arc::new(Echo));
        assert_eq!(server.register_controller::<Echo>().await.unwrap(), vec!["Echo"]);
        assert_eq!(hub.bindings(&queue, "rpc"), vec!["Echo"]);
    }

    #[tokio::test]
    async fn test_shared_queue_name() {
        // ---
        let hub = MemoryHub::new();
        let config = RpcConfig::memory("rpc").with_server_queue("workers");
        let server = RpcServer::new(hub.connector(), config).unwrap();
        server.register_instance(Arc::new(Echo)).await.unwrap();
        server.start().await.unwrap();

        assert_eq!(server.queue_name().await.as_deref(), Some("workers"));
        assert_eq!(hub.queues_bound_to("rpc", "Echo"), vec!["workers"]);
    }

    #[tokio::test]
    async fn test_stop_closes_connection() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub);
        server.start().await.unwrap();
        server.stop().await.unwrap();

        assert_eq!(hub.open_connections(), 0);
        assert_eq!(server.state(), ConnectionState::Disconnected);
        assert!(server.queue_name().await.is_none());
    }
}
