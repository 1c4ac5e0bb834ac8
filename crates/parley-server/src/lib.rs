//! # parley-server
//!
//! Real-time delivery for private messages.
//!
//! - [`hub`]: the connection registry actor (`UserId` -> live connections)
//! - [`connection`]: per-connection read/write actors and teardown
//! - [`bridge`]: broker pattern subscription feeding the registry
//! - [`delivery`]: persist-then-publish for outgoing messages
//! - [`server`]: Axum routes, WebSocket upgrade, graceful shutdown

#![deny(unsafe_code)]

pub mod auth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use auth::{AuthError, TokenService};
pub use config::ServerConfig;
pub use hub::{DeliveryReport, Hub, HubError};
pub use server::{ParleyServer, RunningServer, ServerError};
