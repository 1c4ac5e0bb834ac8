//! In-process broker for single-node deployments and tests.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{compile_pattern, Broker, BrokerError, BrokerMessage, Subscription};

/// Broker backed by one `broadcast` channel; pattern filtering happens on
/// the subscriber side.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
}

impl MemoryBroker {
    /// `buffer` is how many messages a slow subscriber may fall behind before
    /// it starts skipping.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, BrokerError> {
        let msg = BrokerMessage {
            channel: channel.to_string(),
            payload,
        };
        // No subscribers is not an error; the message just has no audience.
        let receivers = self.tx.send(msg).unwrap_or(0);
        debug!(channel, receivers, "published");
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        let matcher = compile_pattern(pattern)?;
        let rx = self.tx.subscribe();
        let owned = pattern.to_string();

        let stream = futures::stream::unfold((rx, matcher, owned), |(mut rx, matcher, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if matcher.is_match(&msg.channel) => {
                        return Some((msg, (rx, matcher, pattern)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Subscription::new(pattern, stream))
    }
}
