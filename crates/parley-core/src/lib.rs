//! # parley-core
//!
//! Types shared by every parley crate: branded identifiers, the message
//! [`Envelope`](envelope::Envelope) and broker channel naming.

#![deny(unsafe_code)]

pub mod envelope;
pub mod ids;
pub mod topics;

pub use envelope::{Envelope, EnvelopeError};
pub use ids::{ConnectionId, MessageId, UserId};
