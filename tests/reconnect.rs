// tests/reconnect.rs

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use amqp_rpc::{
    // ---
    ConnectionState,
    Controller,
    MemoryHub,
    MethodSet,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcServer,
};

struct Echo;

impl Controller for Echo {
    fn methods(methods: &mut MethodSet<Self>) {
        methods.method("Echo", |_echo: Arc<Self>, value: Value| async move { Ok(value) });
    }
}

struct Clock;

impl Controller for Clock {
    fn methods(methods: &mut MethodSet<Self>) {
        methods.method_no_params("Now", |_clock: Arc<Self>| async move { Ok(42u64) });
    }
}

fn config() -> RpcConfig {
    // ---
    RpcConfig::memory("rpc")
        .with_call_timeout(Duration::from_secs(5))
        .with_connect_timeout(Duration::from_secs(5))
        .with_connect_retry_interval(Duration::from_millis(20))
}

/// Poll `cond` until it holds, failing the test after five seconds.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    // ---
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_broker_restart_rebinds_and_recovers() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = RpcServer::new(hub.connector(), config())?;
    server.register_instance(Arc::new(Echo)).await?;
    server.start().await?;

    let client = RpcClient::new(hub.connector(), config())?;
    let reply: Value = client.request("Echo", &json!(1)).await?;
    assert_eq!(reply, json!(1));

    let old_queue = server.queue_name().await.expect("server is bound");
    let old_reply_queue = client.reply_queue().expect("client is connected");

    assert_eq!(hub.disconnect_all(), 2);
    assert!(!hub.queue_exists(&old_queue));

    wait_until("server reconnect", || server.reconnect_count() == 1).await;
    wait_until("client reconnect", || client.reconnect_count() == 1).await;
    assert_eq!(server.state(), ConnectionState::Connected);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(hub.open_connections(), 2);

    let new_queue = server.queue_name().await.expect("server is bound again");
    assert_ne!(new_queue, old_queue);
    assert_eq!(hub.bindings(&new_queue, "rpc"), vec!["Echo"]);
    assert_ne!(client.reply_queue().expect("client is connected"), old_reply_queue);

    let reply: Value = client.request("Echo", &json!(2)).await?;
    assert_eq!(reply, json!(2));

    client.close().await?;
    server.stop().await?;
    assert_eq!(hub.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn test_call_right_after_client_drop_uses_new_reply_queue() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = RpcServer::new(hub.connector(), config().with_connection_name("callee"))?;
    server.register_instance(Arc::new(Echo)).await?;
    server.start().await?;

    let client = RpcClient::new(hub.connector(), config().with_connection_name("caller"))?;
    client.connect().await?;
    let old_reply_queue = client.reply_queue().expect("client is connected");

    // Only the client's session goes away, and the call follows at once,
    // before the client's supervisor has had a chance to run.
    assert_eq!(hub.disconnect("caller"), 1);
    let reply: Value = client.request("Echo", &json!("again")).await?;
    assert_eq!(reply, json!("again"));

    let reply_queue = client.reply_queue().expect("client is connected");
    assert_ne!(reply_queue, old_reply_queue);
    assert!(!hub.queue_exists(&old_reply_queue));
    assert_eq!(client.reconnect_count(), 1);
    assert_eq!(server.reconnect_count(), 0);

    client.close().await?;
    server.stop().await
}

#[tokio::test]
async fn test_registration_while_disconnected_is_bound_on_reconnect() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = RpcServer::new(
        hub.connector(),
        config().with_connect_timeout(Duration::from_secs(30)),
    )?;
    server.register_instance(Arc::new(Echo)).await?;
    server.start().await?;

    let mut state = server.subscribe_state();
    hub.set_reachable(false);
    hub.disconnect_all();
    let _ = state.wait_for(|s| *s != ConnectionState::Connected).await;

    // Accepted while the broker is away; bound once it comes back.
    server.register_instance(Arc::new(Clock)).await?;
    assert_eq!(server.registered_methods(), vec!["Echo", "Now"]);

    hub.set_reachable(true);
    wait_until("server reconnect", || server.reconnect_count() == 1).await;

    let queue = server.queue_name().await.expect("server is bound");
    assert_eq!(hub.bindings(&queue, "rpc"), vec!["Echo", "Now"]);

    let client = RpcClient::new(hub.connector(), config())?;
    assert_eq!(client.request_no_params::<u64>("Now").await?, 42);

    client.close().await?;
    server.stop().await
}

#[tokio::test]
async fn test_client_reconnects_lazily_after_failed_reconnect() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let server = RpcServer::new(hub.connector(), config())?;
    server.register_instance(Arc::new(Echo)).await?;
    server.start().await?;

    let client = RpcClient::new(
        hub.connector(),
        config().with_connect_timeout(Duration::from_millis(100)),
    )?;
    client.connect().await?;

    hub.set_reachable(false);
    hub.disconnect_all();

    // The client's retry budget runs out while the broker is away.
    let mut state = client.subscribe_state();
    let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
    assert!(client.reply_queue().is_none());

    hub.set_reachable(true);
    wait_until("server reconnect", || server.reconnect_count() == 1).await;

    // The next call opens a fresh session.
    let reply: Value = client.request("Echo", &json!("back")).await?;
    assert_eq!(reply, json!("back"));
    assert!(client.reply_queue().is_some());

    client.close().await?;
    server.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_timeout() {
    // ---
    let hub = MemoryHub::new();
    hub.set_reachable(false);

    let client = RpcClient::new(
        hub.connector(),
        RpcConfig::memory("rpc")
            .with_connect_timeout(Duration::from_secs(3))
            .with_connect_retry_interval(Duration::from_secs(1)),
    )
    .unwrap();

    let started = tokio::time::Instant::now();
    let result = client.connect().await;

    assert!(matches!(result, Err(RpcError::ConnectTimeout(t)) if t == Duration::from_secs(3)));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(hub.total_connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_waits_for_broker_to_come_up() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    hub.set_reachable(false);

    let server = RpcServer::new(hub.connector(), config())?;
    server.register_instance(Arc::new(Echo)).await?;

    let starting = {
        let hub = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            hub.set_reachable(true);
        })
    };

    server.start().await?;
    starting.await.expect("helper task panicked");
    assert_eq!(server.state(), ConnectionState::Connected);

    let client = RpcClient::new(hub.connector(), config())?;
    let reply: Value = client.request("Echo", &json!({"late": true})).await?;
    assert_eq!(reply, json!({"late": true}));

    client.close().await?;
    server.stop().await
}

#[tokio::test]
async fn test_stop_is_final() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let client = RpcClient::new(hub.connector(), config())?;
    client.connect().await?;
    client.close().await?;

    assert!(matches!(client.connect().await, Err(RpcError::Shutdown)));
    assert!(matches!(
        client.request::<_, Value>("Echo", &json!(1)).await,
        Err(RpcError::Shutdown)
    ));
    assert_eq!(hub.open_connections(), 0);
    Ok(())
}
