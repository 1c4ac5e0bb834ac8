//! Delivery service: persist a message, then hand it to the broker.

use std::sync::Arc;

use metrics::counter;
use parley_broker::Broker;
use parley_core::topics::user_channel;
use parley_core::{Envelope, UserId};
use parley_store::{MessageRepo, StoreError};
use tracing::{info, instrument, warn};

use crate::metrics::MESSAGES_SENT_TOTAL;

/// Why a send or history request failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("recipient is required")]
    EmptyRecipient,
    #[error("content is empty")]
    EmptyContent,
    #[error("content is {len} bytes, limit is {max}")]
    ContentTooLong { len: usize, max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DeliveryError {
    /// Whether the caller sent something unacceptable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyRecipient | Self::EmptyContent | Self::ContentTooLong { .. }
        )
    }
}

/// Accepts outgoing messages and serves conversation history.
pub struct DeliveryService {
    repo: MessageRepo,
    broker: Arc<dyn Broker>,
    max_content_len: usize,
}

impl DeliveryService {
    pub fn new(repo: MessageRepo, broker: Arc<dyn Broker>, max_content_len: usize) -> Self {
        Self {
            repo,
            broker,
            max_content_len,
        }
    }

    /// Persist and publish a message from `from` to `to`.
    ///
    /// The stored envelope is returned even if publishing fails; live push is
    /// best effort and the recipient can still read it from history.
    #[instrument(skip_all, fields(from_id = %from, to_id = %to))]
    pub async fn send_message(
        &self,
        from: UserId,
        to: UserId,
        content: String,
    ) -> Result<Envelope, DeliveryError> {
        if to.as_str().trim().is_empty() {
            return Err(DeliveryError::EmptyRecipient);
        }
        if content.trim().is_empty() {
            return Err(DeliveryError::EmptyContent);
        }
        if content.len() > self.max_content_len {
            return Err(DeliveryError::ContentTooLong {
                len: content.len(),
                max: self.max_content_len,
            });
        }

        let envelope = Envelope::new(from, to, content);
        let repo = self.repo.clone();
        let stored = envelope.clone();
        tokio::task::spawn_blocking(move || repo.insert(&stored)).await??;

        let payload = envelope.encode()?;
        let channel = user_channel(&envelope.to_id);
        match self.broker.publish(&channel, payload.into_bytes()).await {
            Ok(receivers) => {
                info!(message_id = %envelope.id, channel, receivers, "message published");
            }
            Err(e) => {
                warn!(message_id = %envelope.id, channel, error = %e, "publish failed, message stored only");
            }
        }
        counter!(MESSAGES_SENT_TOTAL).increment(1);
        Ok(envelope)
    }

    /// Messages between `me` and `other`, newest first.
    pub async fn history(
        &self,
        me: UserId,
        other: UserId,
        limit: usize,
    ) -> Result<Vec<Envelope>, DeliveryError> {
        let repo = self.repo.clone();
        let messages = tokio::task::spawn_blocking(move || repo.conversation(&me, &other, limit)).await??;
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parley_broker::{BrokerError, MemoryBroker, Subscription};
    use parley_store::Database;

    use super::*;

    fn service_with(broker: Arc<dyn Broker>) -> DeliveryService {
        let repo = MessageRepo::new(Database::in_memory().unwrap());
        DeliveryService::new(repo, broker, 16)
    }

    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<usize, BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }

        async fn psubscribe(&self, _pattern: &str) -> Result<Subscription, BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn send_persists_then_publishes_to_recipient_channel() {
        let broker = Arc::new(MemoryBroker::new(16));
        let mut sub = broker.psubscribe("user:*:messages").await.unwrap();
        let svc = service_with(broker);

        let env = svc
            .send_message(UserId::from_raw("alice"), UserId::from_raw("bob"), "hi".into())
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "user:bob:messages");
        assert_eq!(Envelope::decode(&msg.payload).unwrap(), env);

        let history = svc
            .history(UserId::from_raw("bob"), UserId::from_raw("alice"), 50)
            .await
            .unwrap();
        assert_eq!(history, vec![env]);
    }

    #[tokio::test]
    async fn publish_failure_still_returns_stored_message() {
        let svc = service_with(Arc::new(DownBroker));
        let env = svc
            .send_message(UserId::from_raw("alice"), UserId::from_raw("bob"), "kept".into())
            .await
            .unwrap();

        let history = svc
            .history(UserId::from_raw("alice"), UserId::from_raw("bob"), 50)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, env.id);
    }

    #[tokio::test]
    async fn validation_errors() {
        let svc = service_with(Arc::new(MemoryBroker::new(4)));
        let alice = || UserId::from_raw("alice");

        let err = svc
            .send_message(alice(), UserId::from_raw(""), "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::EmptyRecipient));

        let err = svc
            .send_message(alice(), UserId::from_raw("bob"), "   ".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::EmptyContent));

        let err = svc
            .send_message(alice(), UserId::from_raw("bob"), "x".repeat(17))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ContentTooLong { len: 17, max: 16 }));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn rejected_message_is_not_stored() {
        let svc = service_with(Arc::new(MemoryBroker::new(4)));
        let _ = svc
            .send_message(UserId::from_raw("alice"), UserId::from_raw("bob"), String::new())
            .await;
        let history = svc
            .history(UserId::from_raw("alice"), UserId::from_raw("bob"), 50)
            .await
            .unwrap();
        assert!(history.is_empty());
    }
}
