use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::KvError;

// ---------------------------------------------------------------------------
// Pipeline operations
// ---------------------------------------------------------------------------

/// One operation in an ordered pipeline. Only the commands the platform
/// actually batches are represented here.
#[derive(Debug, Clone)]
pub enum KvOp {
    HincrBy { key: String, field: String, delta: i64 },
    HincrByFloat { key: String, field: String, delta: f64 },
    Hset { key: String, field: String, value: String },
    Hsetnx { key: String, field: String, value: String },
    Hget { key: String, field: String },
    Sadd { key: String, member: String },
    Srem { key: String, member: String },
    Delete { key: String },
}

/// One pipeline result, in the same position as its [`KvOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Nil,
    Int(i64),
    Text(String),
}

impl KvValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            KvValue::Int(i) => Some(*i),
            KvValue::Text(s) => s.parse().ok(),
            KvValue::Nil => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Stream of `(channel, payload)` messages produced by [`Kv::subscribe`].
///
/// Dropping the subscription tears down the underlying listener.
pub struct Subscription {
    rx: mpsc::Receiver<(String, String)>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<(String, String)>) -> Self {
        Self { rx }
    }

    /// Receive the next message, or `None` when the connection closed.
    pub async fn recv(&mut self) -> Option<(String, String)> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Kv trait
// ---------------------------------------------------------------------------

/// The key-value surface the platform depends on.
///
/// All counters that must be correct across processes live behind this trait;
/// the store is the single source of truth for them. Increment operations are
/// serialized by the server, so concurrent callers observe a strict total
/// order.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Atomically increment `key` and, only when this created the key, set
    /// its expiry to `ttl_seconds`. Returns the post-increment value.
    ///
    /// Implementations must perform this server-side (script or equivalent
    /// transaction); a read-then-write sequence is non-conforming.
    async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> Result<i64, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set `key`, optionally with an expiry in seconds.
    async fn set(&self, key: &str, value: &str, ex: Option<u64>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), KvError>;

    // --- hash ops ---

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError>;

    async fn hincrbyfloat(&self, key: &str, field: &str, delta: f64) -> Result<f64, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    /// Set `field` only if it does not exist yet. Returns `true` when the
    /// field was written.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    // --- set ops ---

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;

    // --- pub/sub ---

    /// Publish `payload` on `channel`; returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, KvError>;

    /// Subscribe to the given channels and stream `(channel, payload)` pairs.
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, KvError>;

    // --- pipeline ---

    /// Execute `ops` in order and return their results in the same order.
    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<Vec<KvValue>, KvError>;

    /// Probe connectivity and re-establish the connection if needed.
    async fn reconnect(&self) -> Result<(), KvError>;
}
