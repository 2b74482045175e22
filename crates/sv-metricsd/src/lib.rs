//! surveyor metrics service.
//!
//! Aggregates network layout and health telemetry from the upstream
//! collectors into per-network topology snapshots, publishes them on the
//! metrics bus, and serves the WebSocket gateway that streams bus events to
//! dashboard clients.

pub mod aggregator;
pub mod config;
pub mod hub;
pub mod publisher;
pub mod routes;
pub mod upstream;
pub mod ws;

pub use aggregator::Aggregator;
pub use config::MetricsConfig;
pub use hub::SnapshotHub;
pub use publisher::BusPublisher;
pub use upstream::UpstreamClient;
