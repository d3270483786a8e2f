//! Bounded connect retry.
//!
//! [`connect_with_retry`] keeps asking a [`Connector`] for a session until one
//! opens or the retry budget in [`ConnectRetry`] runs out.
//!
//! # Retry Strategy
//!
//! - Only retries [`RpcError::BrokerUnreachable`] errors; anything else fails
//!   immediately
//! - Waits a fixed `interval` between attempts, shortened so the final wait
//!   never overshoots the budget
//! - Fails with [`RpcError::ConnectTimeout`] once `timeout` has elapsed since
//!   the first attempt
//! - Gives up with [`RpcError::Shutdown`] as soon as the owner starts stopping
//! - Logs each retry attempt with timing information for debugging

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::{
    // ---
    log_debug,
    log_warn,
    ConnectRetry,
    Connector,
    Result,
    RpcError,
    TransportPtr,
};

/// Connect through `connector`, retrying per `retry`.
///
/// A `true` on `stop` ends the loop before the next attempt or during a wait.
pub(crate) async fn connect_with_retry(
    connector: &dyn Connector,
    connection_name: &str,
    retry: &ConnectRetry,
    stop: &watch::Receiver<bool>,
) -> Result<TransportPtr> {
    // ---
    let mut stop = stop.clone();
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if *stop.borrow() {
            return Err(RpcError::Shutdown);
        }

        attempt += 1;
        let details = match connector.connect(connection_name).await {
            Ok(transport) => {
                log_debug!("{connection_name}: connected on attempt {attempt}");
                return Ok(transport);
            }
            Err(RpcError::BrokerUnreachable(details)) => details,
            Err(err) => return Err(err),
        };

        let elapsed = started.elapsed();
        if elapsed >= retry.timeout {
            log_warn!(
                "{connection_name}: giving up after {attempt} attempts in {elapsed:?}: {details}"
            );
            return Err(RpcError::ConnectTimeout(retry.timeout));
        }

        let wait = retry.interval.min(retry.timeout - elapsed);
        log_warn!(
            "{connection_name}: broker unreachable (attempt {attempt}), retrying in {wait:?}: {details}"
        );
        tokio::select! {
            _ = sleep(wait.max(Duration::from_millis(1))) => {}
            _ = stop_requested(&mut stop) => return Err(RpcError::Shutdown),
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // ---
    if stop.wait_for(|stopping| *stopping).await.is_err() {
        // Owner is gone without stopping; only the sleep can end the wait.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MemoryHub;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn running() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    struct Flaky {
        hub: Arc<MemoryHub>,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Connector for Flaky {
        async fn connect(&self, name: &str) -> Result<TransportPtr> {
            // ---
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RpcError::BrokerUnreachable("refused".into()));
            }
            self.hub.connector().connect(name).await
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            hub: MemoryHub::new(),
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        // ---
        let connector = flaky(2);
        let retry = ConnectRetry::default();
        let started = Instant::now();

        let (_stop_tx, stop) = running();
        let result = connect_with_retry(&connector, "t", &retry, &stop).await;

        assert!(result.is_ok());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        // ---
        let connector = flaky(u32::MAX);
        let retry = ConnectRetry {
            timeout: Duration::from_secs(12),
            interval: Duration::from_secs(5),
        };
        let started = Instant::now();

        let (_stop_tx, stop) = running();
        let result = connect_with_retry(&connector, "t", &retry, &stop).await;

        assert!(matches!(result, Err(RpcError::ConnectTimeout(d)) if d == retry.timeout));
        // Attempts at 0s, 5s, 10s and 12s.
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        // ---
        struct Broken;

        #[async_trait::async_trait]
        impl Connector for Broken {
            async fn connect(&self, _name: &str) -> Result<TransportPtr> {
                Err(RpcError::Config("bad credentials".into()))
            }
        }

        let (_stop_tx, stop) = running();
        let result = connect_with_retry(&Broken, "t", &ConnectRetry::default(), &stop).await;
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[tokio::test]
    async fn test_stopped_before_first_attempt() {
        // ---
        let connector = flaky(0);
        let (_stop_tx, stop) = watch::channel(true);
        let result = connect_with_retry(&connector, "t", &ConnectRetry::default(), &stop).await;
        assert!(matches!(result, Err(RpcError::Shutdown)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait() {
        // ---
        let connector = Arc::new(flaky(u32::MAX));
        let (stop_tx, stop) = running();
        let started = Instant::now();

        let task = {
            let connector = connector.clone();
            tokio::spawn(async move {
                connect_with_retry(connector.as_ref(), "t", &ConnectRetry::default(), &stop).await
            })
        };

        sleep(Duration::from_secs(7)).await;
        stop_tx.send_replace(true);

        assert!(matches!(task.await.unwrap(), Err(RpcError::Shutdown)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }
}
