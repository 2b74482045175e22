//! Rate limiting and quota enforcement for surveyor services.
//!
//! Two enforcement models, both backed by shared state:
//! - calendar-day quotas counted atomically in the KV store, keyed
//!   `rl:<service>:<user>:<endpoint>:<YYYY-MM-DD>` with a TTL that expires
//!   at the next UTC midnight;
//! - an in-process spacing throttle (global / per-client / per-endpoint
//!   tiers) for edge protection, exposed as a tower layer.
//!
//! Per-user overrides persist in the relational store with an explicit
//! tri-state policy: default, unlimited, or a custom daily count.

pub mod daily;
pub mod limits;
pub mod middleware;
pub mod throttle;

pub use daily::{QuotaEngine, QuotaError, QuotaStatus};
pub use limits::{LimitPolicy, MemoryRateLimitStore, PgRateLimitStore, RateLimitStore, UserRateLimitRow};
pub use middleware::ThrottleLayer;
pub use throttle::{EdgeThrottle, RateExceeded, RatePolicy, Throttle};
