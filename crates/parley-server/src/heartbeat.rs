//! Ping/pong liveness.
//!
//! The write actor sends a Ping every `ping_interval`; the read actor holds a
//! deadline of `pong_timeout` that every Pong pushes forward. A peer that
//! stops answering is cut off when the deadline passes.

use std::time::Duration;

use tokio::time::Instant;

/// Rejected heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    /// A zero ping interval would spin.
    #[error("ping interval must be non-zero")]
    ZeroInterval,
    /// The peer would time out before it is pinged.
    #[error("ping interval {ping:?} must be shorter than pong timeout {pong:?}")]
    IntervalNotShorter { ping: Duration, pong: Duration },
}

/// Validated heartbeat timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl HeartbeatConfig {
    /// Validate a ping interval against the pong timeout.
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Result<Self, HeartbeatError> {
        if ping_interval.is_zero() {
            return Err(HeartbeatError::ZeroInterval);
        }
        if ping_interval >= pong_timeout {
            return Err(HeartbeatError::IntervalNotShorter {
                ping: ping_interval,
                pong: pong_timeout,
            });
        }
        Ok(Self {
            ping_interval,
            pong_timeout,
        })
    }

    /// Ping at nine tenths of the timeout.
    pub fn from_pong_timeout(pong_timeout: Duration) -> Result<Self, HeartbeatError> {
        Self::new(pong_timeout * 9 / 10, pong_timeout)
    }

    /// How often the write actor pings.
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// How long the read actor waits for a pong.
    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

/// Read-side deadline tracker.
#[derive(Debug)]
pub struct Liveness {
    timeout: Duration,
    deadline: Instant,
    pongs: u64,
}

impl Liveness {
    /// Start with a deadline one `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            pongs: 0,
        }
    }

    /// Record a pong and push the deadline out by a full timeout.
    pub fn extend(&mut self) {
        self.pongs += 1;
        self.deadline = Instant::now() + self.timeout;
    }

    /// Instant after which the peer is considered dead.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Pongs seen so far.
    pub fn pongs(&self) -> u64 {
        self.pongs
    }
}
