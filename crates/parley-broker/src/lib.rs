//! # parley-broker
//!
//! The message broker seam between the delivery service (publisher) and
//! every server instance's bridge (pattern subscriber).
//!
//! - [`Broker`]: publish to a channel, subscribe to a channel pattern
//! - [`Subscription`]: stream of [`BrokerMessage`]s matching the pattern
//! - [`MemoryBroker`]: single-process implementation over `tokio::sync::broadcast`
//! - [`RedisBroker`]: Redis `PUBLISH`/`PSUBSCRIBE`, shared by every server process
//! - [`connect`]: pick one from configuration

#![deny(unsafe_code)]

mod memory;
mod remote;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use globset::{Glob, GlobMatcher};
use tracing::warn;

pub use memory::MemoryBroker;
pub use remote::RedisBroker;

/// Errors surfaced by a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The pattern is not valid glob syntax.
    #[error("invalid channel pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    /// The broker could not be reached or rejected the command.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A message received on a pattern subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete channel the message was published to.
    pub channel: String,
    /// Raw message body.
    pub payload: Vec<u8>,
}

/// A live pattern subscription. Yields `None` once the broker goes away.
pub struct Subscription {
    pattern: String,
    inner: Pin<Box<dyn Stream<Item = BrokerMessage> + Send>>,
}

impl Subscription {
    /// Wrap a broker-specific message stream.
    pub fn new(
        pattern: impl Into<String>,
        stream: impl Stream<Item = BrokerMessage> + Send + 'static,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            inner: Box::pin(stream),
        }
    }

    /// Pattern this subscription was opened with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching message, or `None` when the subscription has ended.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.inner.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Publish/subscribe transport shared by every server instance.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish `payload` on `channel`. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, BrokerError>;

    /// Subscribe to every channel matching a glob `pattern` (`*` matches any run).
    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;
}

/// Connect to the broker at `url`, or fall back to an in-process
/// [`MemoryBroker`] with `buffer` slots when no url is configured.
///
/// Without a url, delivery only reaches connections on this process.
pub async fn connect(url: Option<&str>, buffer: usize) -> Result<Arc<dyn Broker>, BrokerError> {
    match url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Ok(Arc::new(RedisBroker::connect(url).await?)),
        None => {
            warn!("no broker url configured, live delivery limited to this process");
            Ok(Arc::new(MemoryBroker::new(buffer)))
        }
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<GlobMatcher, BrokerError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}
