//! surveyor backend edge.
//!
//! The authenticated front door of the platform: resolves caller identity,
//! applies role guards, owns the network/permission data model, and forwards
//! everything else to the downstream collectors with uniform error
//! translation, including server-sent-event streaming.

pub mod config;
pub mod networks;
pub mod proxy;
pub mod routes;
pub mod verify;

pub use config::EdgeConfig;
pub use networks::{MemoryNetworkStore, Network, NetworkPermission, NetworkStore, PermissionRole, PgNetworkStore};
pub use proxy::ProxyClient;
pub use verify::RemoteAuthVerifier;
