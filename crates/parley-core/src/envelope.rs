//! The addressed unit of data carried from the delivery service, through the
//! broker, to a recipient's live connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

/// Errors raised while decoding an envelope from the broker.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no recipient")]
    MissingRecipient,
}

/// A single private message. Immutable once published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: MessageId,
    pub from_id: UserId,
    pub to_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Envelope {
    /// Build a fresh envelope stamped with the current time.
    pub fn new(from_id: UserId, to_id: UserId, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            from_id,
            to_id,
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Decode an envelope received from the broker.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.to_id.as_str().is_empty() {
            return Err(EnvelopeError::MissingRecipient);
        }
        Ok(envelope)
    }

    /// Canonical JSON encoding, used both on the broker and on the socket.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
