use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique correlation identifier used to match RPC requests and replies.
///
/// Carried in the AMQP `correlation_id` message property. Opaque to the
/// transport layer; generated by the caller as a random UUID and assumed
/// collision-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared string form, as carried in an [`Envelope`](crate::Envelope).
    pub fn as_shared(&self) -> Arc<str> {
        self.0.clone()
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<Arc<str>> for CorrelationId {
    fn from(value: Arc<str>) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
