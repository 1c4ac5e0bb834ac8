//! Redis-backed broker. Every server process connects to the same Redis, so
//! a message published by one process reaches pattern subscribers on all of
//! them.

use std::fmt;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::{compile_pattern, Broker, BrokerError, BrokerMessage, Subscription};

fn unavailable(e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

/// Broker over Redis `PUBLISH` and `PSUBSCRIBE`.
///
/// Publishing shares one multiplexed connection; each subscription opens its
/// own pub/sub connection and ends when that connection drops.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        info!("redis broker connected");
        Ok(Self { client, publisher })
    }
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, BrokerError> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(channel, payload).await.map_err(unavailable)?;
        debug!(channel, receivers, "published");
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        // Redis accepts the same glob syntax; reject bad patterns up front.
        let _ = compile_pattern(pattern)?;
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.psubscribe(pattern).await.map_err(unavailable)?;
        info!(pattern, "redis pattern subscription open");

        let stream = pubsub.into_on_message().map(|msg| BrokerMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(Subscription::new(pattern, stream))
    }
}
