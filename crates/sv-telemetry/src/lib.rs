//! Telemetry for surveyor services: logging initialisation and endpoint
//! usage tracking.
//!
//! Usage statistics are aggregated into KV hashes so every service reports
//! into the same cross-process counters; the tower middleware buffers
//! records in memory and flushes them in batches.

pub mod logging;
pub mod middleware;
pub mod shutdown;
pub mod usage;

pub use logging::{init_logging, init_logging_json};
pub use shutdown::ShutdownSignal;
pub use middleware::{UsageTrackingLayer, UsageTrackingMiddleware};
pub use usage::{
    EndpointUsage, EndpointUsageRecord, ServiceUsageSummary, UsageStatsResponse, UsageTracker,
};
