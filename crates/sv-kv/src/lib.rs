//! Key-value store adapter for surveyor services.
//!
//! Wraps the external key-value/pub-sub store behind the [`Kv`] trait,
//! exposing only the operations the rest of the platform needs: atomic
//! counters with TTL, get/set with expiry, hash and set aggregation,
//! pub/sub, and ordered pipelines.
//!
//! Two implementations are provided: [`RedisKv`] for production and
//! [`MemoryKv`] for tests and single-process development. Callers hold an
//! `Arc<dyn Kv>` and must treat every call as fallible — on connection loss
//! operations fail fast with [`KvError::Connection`] and the caller decides
//! how to degrade. Reconnection is an explicit operation, never implicit
//! retry.

mod error;
mod memory;
mod redis_store;
mod store;

pub use error::KvError;
pub use memory::MemoryKv;
pub use redis_store::RedisKv;
pub use store::{Kv, KvOp, KvValue, Subscription};
