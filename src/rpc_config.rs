//! Public, transport-agnostic RPC configuration.
//!
//! This type intentionally contains no transport-specific concepts.
//! Transport layers interpret `broker_uri` into concrete connection settings.

use std::time::Duration;

use crate::{Result, RpcError};

/// Default exchange used for RPC requests when none is configured.
pub const DEFAULT_RPC_EXCHANGE: &str = "rpc";

/// Bounded connect retry with a fixed interval between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRetry {
    /// Total time allowed from the first attempt before giving up with
    /// [`RpcError::ConnectTimeout`].
    ///
    /// Default: 300 seconds
    pub timeout: Duration,

    /// Wait between attempts when the broker is unreachable.
    ///
    /// Default: 5 seconds
    pub interval: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
        }
    }
}

/// RPC client and server configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker URI, e.g. `"amqp://localhost:5672/%2f"` or `"memory://"`.
    pub broker_uri: String,

    /// Name of the direct-routed exchange that carries requests.
    pub exchange: String,

    /// Connection name used in logs (and reported to the broker where supported).
    pub connection_name: String,

    /// Connect retry policy, applied to the first connect and every reconnect.
    pub connect_retry: ConnectRetry,

    /// How long a call waits for its reply.
    ///
    /// Default: 30 seconds
    pub call_timeout: Duration,

    /// Named inbound queue for servers.
    ///
    /// `None` (the default) gives every server its own broker-named exclusive
    /// queue. A name lets several servers share one queue as competing
    /// consumers.
    pub server_queue: Option<String>,

    /// Upper bound on concurrently running server invocations.
    ///
    /// Default: 64
    pub max_in_flight: u32,

    /// How long `RpcServer::stop()` waits for in-flight invocations.
    ///
    /// Default: 10 seconds
    pub drain_timeout: Duration,

    /// Send an error reply when dispatch fails.
    ///
    /// When `false`, failed invocations produce no reply at all and the
    /// caller runs into its call timeout.
    ///
    /// Default: true
    pub reply_on_error: bool,
}

impl RpcConfig {
    /// Create a configuration for the given broker URI and exchange.
    pub fn with_broker(broker_uri: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            exchange: exchange.into(),
            connection_name: "amqp-rpc".to_string(),
            connect_retry: ConnectRetry::default(),
            call_timeout: Duration::from_secs(30),
            server_queue: None,
            max_in_flight: 64,
            drain_timeout: Duration::from_secs(10),
            reply_on_error: true,
        }
    }

    /// Create an in-memory broker configuration (no network).
    pub fn memory(exchange: impl Into<String>) -> Self {
        Self::with_broker("memory://", exchange)
    }

    /// Build a configuration from process environment variables.
    ///
    /// See [`from_lookup`](Self::from_lookup) for the recognised keys.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// | key                             | meaning                                  |
    /// |---------------------------------|------------------------------------------|
    /// | `RABBITMQ_URI`                  | full broker URI (wins over host)         |
    /// | `RABBITMQ_HOST`                 | host name, expanded to `amqp://host:5672/%2f` |
    /// | `RABBITMQ_EXCHANGE`             | request exchange name                    |
    /// | `RABBITMQ_CONNECT_TIMEOUT_SECS` | connect retry budget                     |
    /// | `RABBITMQ_CALL_TIMEOUT_SECS`    | per-call reply timeout                   |
    /// | `RABBITMQ_SERVER_QUEUE`         | shared server queue name                 |
    /// | `RPC_MAX_IN_FLIGHT`             | server invocation limit                  |
    ///
    /// Missing keys fall back to defaults; with neither URI nor host set the
    /// broker is `amqp://localhost:5672/%2f`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let broker_uri = match (lookup("RABBITMQ_URI"), lookup("RABBITMQ_HOST")) {
            (Some(uri), _) => uri,
            (None, Some(host)) => broker_uri_for_host(&host),
            (None, None) => broker_uri_for_host("localhost"),
        };
        let exchange = lookup("RABBITMQ_EXCHANGE").unwrap_or_else(|| DEFAULT_RPC_EXCHANGE.into());

        let mut config = Self::with_broker(broker_uri, exchange);

        if let Some(secs) = parse_var::<u64>(&lookup, "RABBITMQ_CONNECT_TIMEOUT_SECS")? {
            config.connect_retry.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "RABBITMQ_CALL_TIMEOUT_SECS")? {
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = parse_var::<u32>(&lookup, "RPC_MAX_IN_FLIGHT")? {
            config.max_in_flight = limit;
        }
        config.server_queue = lookup("RABBITMQ_SERVER_QUEUE");

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the builder setters cannot enforce.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] for an empty exchange name or a zero
    /// in-flight limit.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.exchange.is_empty() {
            return Err(RpcError::Config(
                "exchange name must not be empty (the default exchange cannot be bound)".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(RpcError::Config("max_in_flight must be at least 1".into()));
        }
        Ok(())
    }

    /// Set the connection name used in logs.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    /// Set the connect retry budget.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_retry.timeout = timeout;
        self
    }

    /// Set the wait between connect attempts.
    pub fn with_connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry.interval = interval;
        self
    }

    /// Set the per-call reply timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use amqp_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "rpc")
    ///     .with_call_timeout(Duration::from_secs(10));
    /// ```
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Use a named, shared inbound queue for servers.
    pub fn with_server_queue(mut self, name: impl Into<String>) -> Self {
        self.server_queue = Some(name.into());
        self
    }

    /// Set the server invocation limit.
    pub fn with_max_in_flight(mut self, limit: u32) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// Set how long `stop()` waits for in-flight invocations.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Choose between error replies and silent drop on dispatch failure.
    pub fn with_reply_on_error(mut self, enabled: bool) -> Self {
        self.reply_on_error = enabled;
        self
    }
}

fn broker_uri_for_host(host: &str) -> String {
    if host.contains("://") {
        return host.to_string();
    }
    format!("amqp://{host}:5672/%2f")
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    // ---
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RpcError::Config(format!("{key}={raw:?}: {e}"))),
    }
}
