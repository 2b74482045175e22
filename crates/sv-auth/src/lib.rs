//! Identity and token service for surveyor, plus the authorization plumbing
//! shared by every other service.
//!
//! Responsibilities:
//! - signing and verifying bearer tokens (user sessions, long-lived service
//!   identities, invites, password resets) with a shared HS-family secret;
//! - resolving users to roles and plans through the relational store;
//! - federating external identities (`sync_provider_user`);
//! - the uniform [`ApiError`] HTTP error mapping used across services.

pub mod api_error;
pub mod config;
pub mod guard;
pub mod password;
pub mod provider;
pub mod routes;
pub mod store;
pub mod sync;
pub mod token;

pub use api_error::ApiError;
pub use config::AuthConfig;
pub use guard::{AuthenticatedUser, TokenAuthenticator};
pub use store::{MemoryUserStore, PgUserStore, StoreError, UserStore};
pub use token::{Claims, InvalidReason, TokenKind, TokenSigner, TokenVerifier, Verification};
