use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::{CorrelationId, Result, RpcError};

/// Outcome delivered to a waiting call.
pub(super) type Outcome = Result<Bytes>;

struct PendingCall {
    tx: oneshot::Sender<Outcome>,
    created_at: Instant,
}

/// Tracks calls waiting for replies.
///
/// Maps correlation IDs to oneshot channels. Each entry is removed exactly
/// once: by the reply that completes it, or by the caller giving up.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    // ---

    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new pending call under a fresh correlation ID.
    ///
    /// Returns the ID and a receiver that is notified when the reply arrives.
    pub fn register(&mut self) -> (CorrelationId, oneshot::Receiver<Outcome>) {
        // ---
        let (tx, rx) = oneshot::channel();
        let mut id = CorrelationId::generate();
        while self.calls.contains_key(&id) {
            id = CorrelationId::generate();
        }
        self.calls.insert(
            id.clone(),
            PendingCall {
                tx,
                created_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Complete a pending call.
    ///
    /// Returns how long the call waited, or `None` if the ID was unknown.
    pub fn complete(&mut self, correlation_id: &CorrelationId, outcome: Outcome) -> Option<Duration> {
        // ---
        let call = self.calls.remove(correlation_id)?;
        // The receiver may be gone if the caller was cancelled concurrently.
        let _ = call.tx.send(outcome);
        Some(call.created_at.elapsed())
    }

    /// Remove a pending call without delivering anything.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    /// Fail every pending call, returning how many there were.
    pub fn fail_all(&mut self, make_err: impl Fn() -> RpcError) -> usize {
        // ---
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            let _ = call.tx.send(Err(make_err()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
