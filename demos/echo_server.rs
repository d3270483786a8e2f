//! Echo RPC server example using a RabbitMQ broker.
//!
//! Serves `Echo` (returns its argument), `Add` and `Ping`.
//!
//! Run with: cargo run --example echo_server
//!
//! Requires: A RabbitMQ broker on localhost:5672, or `RABBITMQ_URI` /
//! `RABBITMQ_HOST` pointing at one. `RUST_LOG=amqp_rpc=debug` shows the
//! connection lifecycle.
//!
//! Note: For Docker/production deployments, also handle SIGTERM:
//! ```ignore
//! use tokio::signal::unix::{signal, SignalKind};
//! signal(SignalKind::terminate()).unwrap().recv().await;
//! ```
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use amqp_rpc::{Controller, MethodSet, RpcConfig, RpcServer};

#[derive(Default)]
struct EchoService {
    served: AtomicU64,
}

impl EchoService {
    fn count(&self) -> u64 {
        self.served.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Controller for EchoService {
    fn methods(methods: &mut MethodSet<Self>) {
        // ---
        methods
            .method("Echo", |svc: Arc<Self>, value: Value| async move {
                tracing::info!(served = svc.count(), "echo {value}");
                Ok(value)
            })
            .method("Add", |svc: Arc<Self>, (a, b): (i64, i64)| async move {
                svc.count();
                Ok(a + b)
            })
            .method_no_params("Ping", |svc: Arc<Self>| async move {
                svc.count();
                Ok(())
            });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = RpcConfig::from_env()?.with_connection_name("echo-server");
    let server = RpcServer::from_config(config)?;

    server.register_instance(Arc::new(EchoService::default())).await?;
    server.start().await?;

    tracing::info!(
        queue = ?server.queue_name().await,
        methods = ?server.registered_methods(),
        "echo server ready, Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down...");

    // Waits for in-flight requests to reply before closing the connection.
    server.stop().await?;

    Ok(())
}
