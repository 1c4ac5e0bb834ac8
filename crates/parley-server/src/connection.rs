//! Per-connection read and write actors plus the lifecycle task that ties
//! them to the registry.
//!
//! The actors are generic over any `Sink`/`Stream` of WebSocket messages;
//! the server hands them the two halves of an axum `WebSocket`.

use std::fmt::Display;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use parley_core::{ConnectionId, UserId};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::heartbeat::Liveness;
use crate::hub::{ConnectionHandle, Hub, Payload};
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet visible to the registry.
    Connecting,
    /// Registered; actors running.
    Registered,
    /// An actor has ended; unregistering and stopping the sibling.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal step. Steps only go forward, one
    /// state at a time.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Registered)
                | (Self::Registered, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the peer.
    PeerClosed,
    /// No pong before the read deadline.
    PongTimeout,
    /// The transport returned an error while reading.
    ReadFailed(String),
    /// The transport returned an error while writing.
    WriteFailed(String),
    /// A single write took longer than `write_timeout`.
    WriteTimeout,
    /// The registry closed the outbound queue (eviction, replacement, shutdown).
    QueueClosed,
    /// The registry was not running when the connection tried to join.
    RegistryUnavailable,
}

impl CloseReason {
    /// Stable label for logs and the disconnect metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::PongTimeout => "pong_timeout",
            Self::ReadFailed(_) => "read_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::WriteTimeout => "write_timeout",
            Self::QueueClosed => "queue_closed",
            Self::RegistryUnavailable => "registry_unavailable",
        }
    }
}

struct Lifecycle {
    conn_id: ConnectionId,
    state: ConnectionState,
}

impl Lifecycle {
    fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        trace!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

async fn send_timed<S>(sink: &mut S, msg: Message, limit: Duration) -> Result<(), CloseReason>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CloseReason::WriteFailed(e.to_string())),
        Err(_) => Err(CloseReason::WriteTimeout),
    }
}

/// Join `first` with whatever was already queued when it was taken.
///
/// Returns `None` if the queue closes while draining; the batch belongs to an
/// evicted connection and must not be written.
fn coalesce(first: &Payload, queue: &mut mpsc::Receiver<Payload>) -> Option<String> {
    let pending = queue.len();
    let mut frame = String::with_capacity(first.len());
    frame.push_str(first);
    for _ in 0..pending {
        if queue.is_closed() {
            return None;
        }
        match queue.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    Some(frame)
}

/// Drop whatever is still queued and say goodbye.
async fn close_discarding<S>(
    sink: &mut S,
    queue: &mut mpsc::Receiver<Payload>,
    write_timeout: Duration,
    conn_id: &ConnectionId,
) -> CloseReason
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut discarded = 0usize;
    while queue.try_recv().is_ok() {
        discarded += 1;
    }
    debug!(conn_id = %conn_id, discarded, "queue closed, discarding pending payloads");
    let _ = send_timed(sink, Message::Close(None), write_timeout).await;
    CloseReason::QueueClosed
}

/// Drain the outbound queue to the sink and keep the peer pinged.
///
/// Ends when the queue closes (pending items are discarded and a Close frame
/// is sent), or when a write fails or exceeds `write_timeout`.
pub async fn write_actor<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Payload>,
    config: ConnectionConfig,
    conn_id: ConnectionId,
) -> CloseReason
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let every = config.heartbeat.ping_interval();
    let mut ping = tokio::time::interval_at(Instant::now() + every, every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = queue.recv() => {
                let Some(first) = item else {
                    let _ = send_timed(&mut sink, Message::Close(None), config.write_timeout).await;
                    return CloseReason::QueueClosed;
                };
                if queue.is_closed() {
                    return close_discarding(&mut sink, &mut queue, config.write_timeout, &conn_id).await;
                }
                let frame = if config.coalesce_frames {
                    match coalesce(&first, &mut queue) {
                        Some(frame) => frame,
                        None => {
                            return close_discarding(&mut sink, &mut queue, config.write_timeout, &conn_id).await;
                        }
                    }
                } else {
                    first.to_string()
                };
                if let Err(reason) = send_timed(&mut sink, Message::Text(frame.into()), config.write_timeout).await {
                    return reason;
                }
            }
            _ = ping.tick() => {
                if let Err(reason) = send_timed(&mut sink, Message::Ping(Bytes::new()), config.write_timeout).await {
                    return reason;
                }
                trace!(conn_id = %conn_id, "sent ping");
            }
        }
    }
}

/// Watch the inbound half for close and pongs.
///
/// Client text and binary frames are ignored; messages are sent over HTTP.
pub async fn read_actor<R, E>(mut stream: R, pong_timeout: Duration, conn_id: ConnectionId) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut liveness = Liveness::new(pong_timeout);
    loop {
        let next = match tokio::time::timeout_at(liveness.deadline(), stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                debug!(conn_id = %conn_id, pongs = liveness.pongs(), "read deadline expired");
                return CloseReason::PongTimeout;
            }
        };
        match next {
            None | Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
            Some(Err(e)) => return CloseReason::ReadFailed(e.to_string()),
            Some(Ok(Message::Pong(_))) => liveness.extend(),
            // Ping replies are written by the transport.
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                trace!(conn_id = %conn_id, "ignoring inbound data frame");
            }
        }
    }
}

/// Run one connection from registration to teardown.
///
/// Whichever actor ends first triggers teardown: the connection is
/// unregistered (acknowledged by the registry before this returns), then the
/// sibling actor is stopped.
pub async fn run_connection<S, R, E>(
    hub: Hub,
    handle: ConnectionHandle,
    queue: mpsc::Receiver<Payload>,
    mut sink: S,
    stream: R,
    config: ConnectionConfig,
) -> CloseReason
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let conn_id = handle.id.clone();
    let user: UserId = handle.user.clone();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    // A connection the registry refuses never enters the lifecycle.
    if hub.register(handle).await.is_err() {
        warn!(user_id = %user, conn_id = %conn_id, "registry unavailable, closing connection");
        let _ = send_timed(&mut sink, Message::Close(None), config.write_timeout).await;
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => CloseReason::RegistryUnavailable.as_str())
            .increment(1);
        return CloseReason::RegistryUnavailable;
    }
    let mut lifecycle = Lifecycle::new(conn_id.clone());
    lifecycle.advance(ConnectionState::Registered);

    let mut writer = tokio::spawn(write_actor(sink, queue, config, conn_id.clone()));
    let mut reader = tokio::spawn(read_actor(
        stream,
        config.heartbeat.pong_timeout(),
        conn_id.clone(),
    ));

    let (reason, writer_done) = tokio::select! {
        res = &mut writer => {
            reader.abort();
            let reason = res.unwrap_or_else(|e| CloseReason::WriteFailed(e.to_string()));
            (reason, true)
        }
        res = &mut reader => {
            let reason = res.unwrap_or_else(|e| CloseReason::ReadFailed(e.to_string()));
            (reason, false)
        }
    };

    lifecycle.advance(ConnectionState::Closing);
    if let Err(e) = hub.unregister(&user, &conn_id).await {
        debug!(conn_id = %conn_id, error = %e, "unregister skipped");
    }

    if !writer_done {
        // The queue is closed now; give the writer one write to send Close.
        if tokio::time::timeout(config.write_timeout, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }

    lifecycle.advance(ConnectionState::Closed);
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    info!(user_id = %user, conn_id = %conn_id, reason = reason.as_str(), "connection closed");
    reason
}
