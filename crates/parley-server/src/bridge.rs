//! Broker bridge: one pattern subscription covering every user's channel,
//! decoded and handed to the registry.

use std::sync::Arc;

use metrics::counter;
use parley_broker::{BrokerMessage, Subscription};
use parley_core::topics::user_from_channel;
use parley_core::Envelope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{Hub, Payload};
use crate::metrics::BRIDGE_DECODE_FAILURES_TOTAL;

const PREVIEW_LEN: usize = 120;

/// Counters kept by a bridge run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Messages taken from the subscription.
    pub received: u64,
    /// Envelopes handed to the registry.
    pub forwarded: u64,
    /// Payloads dropped as undecodable or misaddressed.
    pub malformed: u64,
}

/// Forwards broker messages to the registry.
pub struct BrokerBridge {
    hub: Hub,
    subscription: Subscription,
    stats: BridgeStats,
}

impl BrokerBridge {
    /// Bridge `subscription` into `hub`. Nothing happens until [`run`](Self::run).
    pub fn new(hub: Hub, subscription: Subscription) -> Self {
        Self {
            hub,
            subscription,
            stats: BridgeStats::default(),
        }
    }

    /// Run until `cancel` fires, the subscription ends, or the registry stops.
    pub async fn run(mut self, cancel: CancellationToken) -> BridgeStats {
        info!(pattern = self.subscription.pattern(), "broker bridge started");
        loop {
            let msg = tokio::select! {
                msg = self.subscription.recv() => msg,
                () = cancel.cancelled() => break,
            };
            let Some(msg) = msg else {
                warn!("broker subscription closed, live delivery stopped");
                break;
            };
            self.stats.received += 1;
            if !self.forward(msg).await {
                warn!("connection registry stopped, bridge exiting");
                break;
            }
        }
        info!(
            received = self.stats.received,
            forwarded = self.stats.forwarded,
            malformed = self.stats.malformed,
            "broker bridge stopped"
        );
        self.stats
    }

    /// Returns `false` once the registry is gone.
    async fn forward(&mut self, msg: BrokerMessage) -> bool {
        let envelope = match Envelope::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.malformed += 1;
                counter!(BRIDGE_DECODE_FAILURES_TOTAL).increment(1);
                warn!(
                    channel = %msg.channel,
                    error = %e,
                    preview = %preview(&msg.payload),
                    "dropping malformed envelope"
                );
                return true;
            }
        };
        if user_from_channel(&msg.channel).as_ref() != Some(&envelope.to_id) {
            self.stats.malformed += 1;
            counter!(BRIDGE_DECODE_FAILURES_TOTAL).increment(1);
            warn!(
                channel = %msg.channel,
                message_id = %envelope.id,
                to_id = %envelope.to_id,
                "envelope recipient does not match channel, dropping"
            );
            return true;
        }
        let payload: Payload = match envelope.encode() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                self.stats.malformed += 1;
                warn!(message_id = %envelope.id, error = %e, "failed to re-encode envelope");
                return true;
            }
        };

        match self.hub.deliver(&envelope.to_id, payload).await {
            Ok(report) => {
                self.stats.forwarded += 1;
                debug!(
                    message_id = %envelope.id,
                    to_id = %envelope.to_id,
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "envelope forwarded"
                );
                true
            }
            Err(_) => false,
        }
    }
}

fn preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}
