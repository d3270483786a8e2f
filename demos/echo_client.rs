//! Echo RPC client example using a RabbitMQ broker.
//!
//! Sends a few requests to a running `echo_server`, including one for a
//! method nobody serves.
//!
//! Run with: cargo run --example echo_client
//!
//! Requires: A RabbitMQ broker and the `echo_server` example running.
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use amqp_rpc::{RpcClient, RpcConfig, RpcError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = RpcConfig::from_env()?.with_connection_name("echo-client");
    let client = RpcClient::from_config(config)?;

    let reply: Value = client.request("Echo", &json!({"x": 1})).await?;
    println!("Echo {{\"x\":1}} -> {reply}");

    let sum: i64 = client.request("Add", &(2, 3)).await?;
    println!("Add 2 + 3 -> {sum}");

    client.request_no_params::<()>("Ping").await?;
    println!("Ping -> ok");

    // Fan out concurrent calls over the one reply queue.
    let calls = (0..5).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.request::<_, i64>("Add", &(i, i)).await })
    });
    for (i, call) in calls.collect::<Vec<_>>().into_iter().enumerate() {
        println!("Add {i} + {i} -> {}", call.await??);
    }

    // Nothing is bound for this name, so the broker drops the request.
    match client
        .call("Missing", bytes::Bytes::new(), Duration::from_secs(2))
        .await
    {
        Err(RpcError::CallTimeout) => println!("Missing -> timed out (no route)"),
        other => println!("Missing -> {other:?}"),
    }

    client.close().await?;
    Ok(())
}
