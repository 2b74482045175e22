//! surveyor notification service.
//!
//! Turns network events into channel deliveries: policy evaluation
//! (enable/priority/quiet-hours/rate-limit/silence), multi-channel dispatch
//! with partial-failure records, per-device anomaly baselining, and the
//! scheduled-broadcast scheduler.

pub mod anomaly;
pub mod broadcast;
pub mod channels;
pub mod config;
pub mod decision;
pub mod history;
pub mod manager;
pub mod members;
pub mod prefs;
pub mod routes;

pub use anomaly::AnomalyDetector;
pub use config::NotifyConfig;
pub use manager::NotificationManager;
