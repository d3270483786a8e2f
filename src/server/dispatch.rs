//! Bounded dispatch of inbound requests.
//!
//! Every request runs in its own task, but at most `limit` run at once. The
//! receive loop waits for a free slot before spawning, so a saturated server
//! stops pulling from its inbox and the broker queue absorbs the burst.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::{
    // ---
    log_debug,
    log_warn,
    Result,
    RpcError,
};

pub(crate) struct Dispatcher {
    permits: Arc<Semaphore>,
    limit: u32,
}

impl Dispatcher {
    pub(crate) fn new(limit: u32) -> Self {
        // ---
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit,
        }
    }

    /// Wait for a free slot, then run `work` in its own task.
    ///
    /// Fails with [`RpcError::Shutdown`] once draining has finished.
    pub(crate) async fn spawn<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // ---
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Shutdown)?;

        tokio::spawn(async move {
            work.await;
            drop(permit);
        });
        Ok(())
    }

    /// Number of invocations currently running.
    pub(crate) fn in_flight(&self) -> usize {
        (self.limit as usize).saturating_sub(self.permits.available_permits())
    }

    /// Wait up to `timeout` for running invocations, then refuse new ones.
    ///
    /// Returns `true` if everything finished in time.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        // ---
        let running = self.in_flight();
        if running > 0 {
            log_debug!("draining {running} in-flight invocation(s)");
        }

        let drained = matches!(
            tokio::time::timeout(timeout, self.permits.acquire_many(self.limit)).await,
            Ok(Ok(_))
        );
        if !drained {
            log_warn!(
                "drain timed out after {timeout:?} with {} invocation(s) still running",
                self.in_flight()
            );
        }
        self.permits.close();
        drained
    }
}
