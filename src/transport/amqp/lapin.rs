//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! an AMQP 0-9-1 broker connection. It follows an **actor-based concurrency
//! model** to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor is responsible for:
//!   - declaring exchanges and queues, and binding them,
//!   - publishing outbound envelopes,
//!   - starting consumers,
//!   - clean shutdown of the connection.
//! - All interaction with the AMQP channel is serialized through this actor;
//!   no other task ever touches the connection directly.
//!
//! Each started consumer runs in its own task that acks deliveries and
//! forwards them, converted to [`Envelope`]s, into the subscription inbox.
//!
//! ## Session end
//!
//! Broker-side connection errors arrive on the connection's event stream and
//! are reported as a `Peer` shutdown. A consumer stream that fails is reported as a
//! `Library` shutdown. Either way the first report wins and `close()` only
//! reports `Application` if nothing else happened first.
//!
//! ## Message properties
//!
//! Only `correlation_id`, `reply_to` and `content_type` cross the transport
//! boundary; everything else in `BasicProperties` is left at its default.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Event,
    ExchangeKind,
};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Connector,
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

//
// Actor commands
//

type Reply<T> = oneshot::Sender<Result<T>>;

enum Cmd {
    //
    DeclareExchange { exchange: String, resp: Reply<()> },
    DeclareQueue { spec: QueueSpec, resp: Reply<Arc<str>> },
    Bind { queue: String, exchange: String, routing_key: String, resp: Reply<()> },
    Consume { queue: String, resp: Reply<SubscriptionHandle> },
    Publish { env: Envelope, resp: Reply<()> },
    Close { resp: Reply<()> },
}

/// AMQP transport implementation using lapin.
pub struct AmqpTransport {
    // ---
    base: TransportBase,
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpTransport {
    /// Wraps an open connection and channel, spawning the actor that owns them.
    fn create(transport_id: String, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let base = TransportBase::new(transport_id.clone());
        let notifier = base.shutdown_notifier();

        let events = watch_connection_events(transport_id.clone(), &connection, notifier.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            transport_id,
            connection,
            channel,
            cmd_rx,
            notifier,
            events,
            consumers: Vec::new(),
        };
        tokio::spawn(actor.run());

        Arc::new(Self { base, cmd_tx })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx.send(make(tx)).await.map_err(|e| {
            let msg = format!("actor command channel closed:{e}");
            RpcError::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed:{e}");
            RpcError::Transport(msg)
        })?
    }
}

/// The shutdown a connection event amounts to, if any.
fn shutdown_for(transport_id: &str, event: &Event) -> Option<ShutdownEvent> {
    // ---
    match event {
        Event::Error(err) => {
            log_error!("[{transport_id}] AMQP connection error: {err}");
            Some(ShutdownEvent::peer(err.to_string()))
        }
        Event::ConnectionBlocked(reason) => {
            log_info!("[{transport_id}] broker blocked the connection: {reason}");
            None
        }
        Event::ConnectionUnblocked => {
            log_info!("[{transport_id}] broker unblocked the connection");
            None
        }
        _ => None,
    }
}

/// Report the first connection error as a peer shutdown.
fn watch_connection_events(
    transport_id: String,
    connection: &Connection,
    notifier: ShutdownNotifier,
) -> JoinHandle<()> {
    // ---
    let events = connection.events_listener();

    tokio::spawn(async move {
        use futures_lite::stream::StreamExt;

        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            if let Some(shutdown) = shutdown_for(&transport_id, &event) {
                notifier.notify(shutdown);
                return;
            }
        }
        log_debug!("[{transport_id}] connection event stream ended");
    })
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    notifier: ShutdownNotifier,
    events: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        let mut close_resp = None;
        while let Some(cmd) = self.cmd_rx.recv().await {
            if let Cmd::Close { resp } = cmd {
                close_resp = Some(resp);
                break;
            }
            self.handle_cmd(cmd).await;
        }

        // A local close must not surface as a connection error.
        self.events.abort();
        for handle in self.consumers.drain(..) {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;
        self.notifier
            .notify(ShutdownEvent::application("closed by application"));

        if let Some(resp) = close_resp {
            let _ = resp.send(Ok(()));
        }

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::DeclareExchange { exchange, resp } => {
                let _ = resp.send(self.do_declare_exchange(&exchange).await);
            }
            Cmd::DeclareQueue { spec, resp } => {
                let _ = resp.send(self.do_declare_queue(&spec).await);
            }
            Cmd::Bind {
                queue,
                exchange,
                routing_key,
                resp,
            } => {
                let _ = resp.send(self.do_bind(&queue, &exchange, &routing_key).await);
            }
            Cmd::Consume { queue, resp } => {
                let _ = resp.send(self.do_consume(queue).await);
            }
            Cmd::Publish { env, resp } => {
                let _ = resp.send(self.do_publish(env).await);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
            }
        }
    }

    async fn do_declare_exchange(&mut self, exchange: &str) -> Result<()> {
        // ---
        self.channel
            .exchange_declare(
                exchange.into(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: exchange declare failed: {e}")))?;

        log_debug!("[{}] Declared exchange: {exchange}", self.transport_id);
        Ok(())
    }

    async fn do_declare_queue(&mut self, spec: &QueueSpec) -> Result<Arc<str>> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };
        let requested = spec.name.clone().unwrap_or_default();

        let queue = self
            .channel
            .queue_declare(requested.as_str().into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        let name = queue.name().as_str();
        log_info!("[{}] Declared queue: {name}", self.transport_id);
        Ok(Arc::from(name))
    }

    async fn do_bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue bind failed: {e}")))?;

        log_debug!(
            "[{}] Bound {queue} to {exchange} for '{routing_key}'",
            self.transport_id
        );
        Ok(())
    }

    async fn do_consume(&mut self, queue: String) -> Result<SubscriptionHandle> {
        // ---
        let tag = format!("{}-{}", self.transport_id, self.consumers.len() + 1);
        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] Started consuming queue: {queue}", self.transport_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let transport_id = self.transport_id.clone();
        let notifier = self.notifier.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            log_error!("[{transport_id}] Failed to ack message: {e}");
                            continue;
                        }

                        let props = &delivery.properties;
                        let env = Envelope {
                            exchange: delivery.exchange.as_str().into(),
                            routing_key: delivery.routing_key.as_str().into(),
                            correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().into()),
                            reply_to: props.reply_to().as_ref().map(|s| s.as_str().into()),
                            content_type: props.content_type().as_ref().map(|s| s.as_str().into()),
                            body: delivery.data.into(),
                        };

                        if tx.send(env).is_err() {
                            log_debug!("[{transport_id}] Subscriber for {queue} dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{transport_id}] Consumer error on {queue}: {e}");
                        notifier.notify(ShutdownEvent::library(e.to_string()));
                        break;
                    }
                }
            }

            log_info!("[{transport_id}] Consumer task ended for queue: {queue}");
        });

        self.consumers.push(handle);
        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let mut props = BasicProperties::default();
        if let Some(id) = &env.correlation_id {
            props = props.with_correlation_id(id.as_ref().into());
        }
        if let Some(reply_to) = &env.reply_to {
            props = props.with_reply_to(reply_to.as_ref().into());
        }
        if let Some(content_type) = &env.content_type {
            props = props.with_content_type(content_type.as_ref().into());
        }

        self.channel
            .basic_publish(
                env.exchange.as_ref().into(),
                env.routing_key.as_ref().into(),
                BasicPublishOptions::default(),
                &env.body,
                props,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!(
            "[{}] Published to '{}' with key '{}'",
            self.transport_id,
            env.exchange,
            env.routing_key
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let exchange = exchange.to_string();
        self.request(|resp| Cmd::DeclareExchange { exchange, resp }).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<Arc<str>> {
        let spec = spec.clone();
        self.request(|resp| Cmd::DeclareQueue { spec, resp }).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        let (queue, exchange, routing_key) =
            (queue.to_string(), exchange.to_string(), routing_key.to_string());
        self.request(|resp| Cmd::Bind {
            queue,
            exchange,
            routing_key,
            resp,
        })
        .await
    }

    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle> {
        let queue = queue.to_string();
        self.request(|resp| Cmd::Consume { queue, resp }).await
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.request(|resp| Cmd::Publish { env, resp }).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        // A dead actor has already released the connection.
        match self.request(|resp| Cmd::Close { resp }).await {
            Ok(()) | Err(RpcError::Transport(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Opens lapin sessions against one broker URI.
pub struct LapinConnector {
    uri: String,
}

impl LapinConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait::async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, connection_name: &str) -> Result<TransportPtr> {
        // ---
        let (connection, channel) = create_amqp_connection(&self.uri, connection_name).await?;
        let transport_id = format!("{connection_name}-{}", uuid::Uuid::new_v4().simple());
        Ok(AmqpTransport::create(transport_id, connection, channel))
    }
}

/// Creates an AMQP connection and channel.
///
/// Every failure is reported as [`RpcError::BrokerUnreachable`] so the
/// connection manager keeps retrying until its budget runs out.
async fn create_amqp_connection(uri: &str, connection_name: &str) -> Result<(Connection, Channel)> {
    // ---
    log_info!("Connecting to AMQP broker: {uri}");

    let props = ConnectionProperties::default().with_connection_name(connection_name.into());
    let connection = Connection::connect(uri, props).await.map_err(|e| {
        let msg = format!("amqp: connection failed: {e}");
        log_error!("{msg}");
        RpcError::BrokerUnreachable(msg)
    })?;

    log_info!("Connected to AMQP broker");

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::BrokerUnreachable(msg)
    })?;

    Ok((connection, channel))
}
