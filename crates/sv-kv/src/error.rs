use thiserror::Error;

/// Errors surfaced by the KV adapter.
///
/// The variants are deliberately coarse: callers only need to distinguish
/// "the store is unreachable" (degrade or fail fast) from "the store
/// rejected the operation" (a bug or data-shape problem).
#[derive(Debug, Error)]
pub enum KvError {
    /// The connection is down or was refused. Operations fail fast with this
    /// kind; reconnection is an explicit separate call.
    #[error("kv connection error: {0}")]
    Connection(String),

    /// The server did not answer within the socket timeout.
    #[error("kv timeout: {0}")]
    Timeout(String),

    /// The server answered with an unexpected type or a protocol-level error.
    #[error("kv protocol error: {0}")]
    Protocol(String),

    /// A server-side script failed to load or run.
    #[error("kv script error: {0}")]
    Script(String),
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            KvError::Timeout(err.to_string())
        } else if err.is_connection_refusal() || err.is_io_error() || err.is_connection_dropped() {
            KvError::Connection(err.to_string())
        } else {
            KvError::Protocol(err.to_string())
        }
    }
}

impl KvError {
    /// True when the error indicates the store is unreachable (as opposed to
    /// a malformed operation).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KvError::Connection(_) | KvError::Timeout(_))
    }
}
