//! Transport execution runner.
//!
//! This module provides the glue between a [`SubscriptionHandle`] and the
//! client and server roles that consume from it.
//!
//! The runner is responsible for:
//! - driving a receive loop over the subscription inbox
//! - dispatching received [`Envelope`]s to a [`TransportConsumer`]
//! - consolidating logging and error handling for inbound messages
//!
//! It does **not** define RPC semantics or retry policies.
//!
//! ### Receive loop
//!
//! [`spawn_consumer`] spawns a long-running task that waits for incoming
//! envelopes. When the queue goes away, the session ends, or the
//! subscription is dropped, the inbox closes and the loop exits naturally.
//! After a reconnect the owner simply spawns a new loop for the new
//! subscription.
//!
//! ### Error handling
//!
//! Errors returned by [`TransportConsumer::handle_envelope`] are best-effort
//! failures: they are logged but do not terminate the receive loop.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_warn,
    Envelope,
    Result,
    SubscriptionHandle,
};

/// A consumer of transport-delivered envelopes.
///
/// Implementations should assume envelopes may arrive in any order and that
/// duplicates are possible after a reconnect.
#[async_trait::async_trait]
pub trait TransportConsumer: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Handle a single incoming envelope.
    ///
    /// Returning an error indicates that the envelope could not be processed,
    /// but does not terminate the receive loop.
    async fn handle_envelope(&self, env: Envelope) -> Result<()>;
}

/// Start a receive loop feeding `handle` into `consumer`.
///
/// The returned [`JoinHandle`] represents the lifetime of the loop. Dropping
/// it does not stop the loop; aborting it does.
pub fn spawn_consumer<C>(mut handle: SubscriptionHandle, consumer: Arc<C>) -> JoinHandle<()>
where
    C: TransportConsumer + ?Sized + 'static,
{
    // ---
    tokio::spawn(async move {
        while let Some(env) = handle.inbox.recv().await {
            if let Err(err) = consumer.handle_envelope(env).await {
                log_warn!("{}: failed to handle envelope: {err}", consumer.name());
            }
        }
        log_debug!("{}: subscription closed", consumer.name());
    })
}
