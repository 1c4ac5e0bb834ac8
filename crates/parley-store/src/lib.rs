//! # parley-store
//!
//! SQLite persistence for private messages. The delivery core never touches
//! this crate directly; the delivery service persists before publishing.

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod messages;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;
