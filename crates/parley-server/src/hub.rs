//! Connection registry.
//!
//! A single actor task owns the `UserId -> connections` map. Every mutation
//! and every lookup travels over its command channel, so membership changes
//! are totally ordered and a `deliver` always sees every `register` that was
//! acknowledged before it.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parley_core::{ConnectionId, UserId};
use parley_settings::DuplicateDevicePolicy;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::metrics::{HUB_DELIVERIES_TOTAL, HUB_EVICTIONS_TOTAL, WS_CONNECTIONS_ACTIVE};

/// A serialized frame body queued for a connection. Shared across devices.
pub type Payload = Arc<str>;

/// Errors returned by [`Hub`] calls.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The registry actor has exited (shutdown).
    #[error("connection registry is not running")]
    Stopped,
}

/// Outcome of a single [`Hub::deliver`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections that accepted the payload.
    pub delivered: usize,
    /// Connections removed because their queue was full or already closed.
    pub evicted: usize,
}

/// The registry's handle on one live connection.
///
/// Holds the only sender of the connection's outbound queue. Dropping the
/// handle closes the queue, which is how eviction reaches the write actor.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Unique per upgrade.
    pub id: ConnectionId,
    /// Authenticated owner.
    pub user: UserId,
    /// Client-supplied device label, used by the duplicate-device policy.
    pub device: Option<String>,
    tx: mpsc::Sender<Payload>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(
        user: UserId,
        device: Option<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user,
            device,
            tx,
        };
        (handle, rx)
    }
}

enum HubCommand {
    Register {
        handle: ConnectionHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        user: UserId,
        conn_id: ConnectionId,
        ack: oneshot::Sender<bool>,
    },
    Deliver {
        recipient: UserId,
        payload: Payload,
        reply: oneshot::Sender<DeliveryReport>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    OnlineUsers {
        reply: oneshot::Sender<usize>,
    },
    UserConnections {
        user: UserId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
}

/// Cloneable handle to the registry actor.
#[derive(Clone, Debug)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Start the registry actor. It runs until `cancel` fires or every
    /// [`Hub`] clone is dropped; on exit all outbound queues close.
    pub fn spawn(config: HubConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let actor = HubActor {
            users: HashMap::new(),
            policy: config.duplicate_policy,
            total: 0,
        };
        let task = tokio::spawn(actor.run(rx, cancel));
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Add a connection. Resolves once the membership is visible to `deliver`.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.request(|ack| HubCommand::Register { handle, ack }).await
    }

    /// Remove a connection. Returns whether it was still registered.
    pub async fn unregister(
        &self,
        user: &UserId,
        conn_id: &ConnectionId,
    ) -> Result<bool, HubError> {
        self.request(|ack| HubCommand::Unregister {
            user: user.clone(),
            conn_id: conn_id.clone(),
            ack,
        })
        .await
    }

    /// Offer `payload` to every live connection of `recipient` without blocking
    /// on any of them. Connections that cannot take it are evicted.
    pub async fn deliver(
        &self,
        recipient: &UserId,
        payload: Payload,
    ) -> Result<DeliveryReport, HubError> {
        self.request(|reply| HubCommand::Deliver {
            recipient: recipient.clone(),
            payload,
            reply,
        })
        .await
    }

    /// Total registered connections.
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        self.request(|reply| HubCommand::ConnectionCount { reply })
            .await
    }

    /// Users with at least one registered connection.
    pub async fn online_users(&self) -> Result<usize, HubError> {
        self.request(|reply| HubCommand::OnlineUsers { reply }).await
    }

    /// Connection ids currently registered for `user`.
    pub async fn user_connections(&self, user: &UserId) -> Result<Vec<ConnectionId>, HubError> {
        self.request(|reply| HubCommand::UserConnections {
            user: user.clone(),
            reply,
        })
        .await
    }
}

struct HubActor {
    users: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    policy: DuplicateDevicePolicy,
    total: usize,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>, cancel: CancellationToken) {
        info!(policy = ?self.policy, "connection registry started");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        info!(remaining = self.total, "connection registry stopped");
        self.users.clear();
        self.total = 0;
        self.publish_gauge();
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { handle, ack } => {
                self.register(handle);
                let _ = ack.send(());
            }
            HubCommand::Unregister { user, conn_id, ack } => {
                let removed = self.remove(&user, &conn_id).is_some();
                if removed {
                    info!(user_id = %user, conn_id = %conn_id, "connection unregistered");
                }
                let _ = ack.send(removed);
            }
            HubCommand::Deliver {
                recipient,
                payload,
                reply,
            } => {
                let report = self.deliver(&recipient, &payload);
                let _ = reply.send(report);
            }
            HubCommand::ConnectionCount { reply } => {
                let _ = reply.send(self.total);
            }
            HubCommand::OnlineUsers { reply } => {
                let _ = reply.send(self.users.len());
            }
            HubCommand::UserConnections { user, reply } => {
                let ids = self
                    .users
                    .get(&user)
                    .map(|conns| conns.keys().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        if self.policy == DuplicateDevicePolicy::Replace {
            if let Some(device) = handle.device.as_deref() {
                let stale: Vec<ConnectionId> = self
                    .users
                    .get(&handle.user)
                    .into_iter()
                    .flat_map(|conns| conns.values())
                    .filter(|c| c.id != handle.id && c.device.as_deref() == Some(device))
                    .map(|c| c.id.clone())
                    .collect();
                for conn_id in stale {
                    if self.remove(&handle.user, &conn_id).is_some() {
                        counter!(HUB_EVICTIONS_TOTAL, "reason" => "replaced").increment(1);
                        info!(user_id = %handle.user, conn_id = %conn_id, device, "connection replaced by newer device session");
                    }
                }
            }
        }

        info!(
            user_id = %handle.user,
            conn_id = %handle.id,
            device = handle.device.as_deref().unwrap_or(""),
            "connection registered"
        );
        let conns = self.users.entry(handle.user.clone()).or_default();
        if conns.insert(handle.id.clone(), handle).is_none() {
            self.total += 1;
        }
        self.publish_gauge();
    }

    fn remove(&mut self, user: &UserId, conn_id: &ConnectionId) -> Option<ConnectionHandle> {
        let conns = self.users.get_mut(user)?;
        let removed = conns.remove(conn_id);
        if conns.is_empty() {
            let _ = self.users.remove(user);
        }
        if removed.is_some() {
            self.total -= 1;
            self.publish_gauge();
        }
        removed
    }

    fn deliver(&mut self, recipient: &UserId, payload: &Payload) -> DeliveryReport {
        let Some(conns) = self.users.get(recipient) else {
            debug!(user_id = %recipient, "no live connections, dropping");
            return DeliveryReport::default();
        };

        let mut report = DeliveryReport::default();
        let mut evict = Vec::new();
        for handle in conns.values() {
            match handle.tx.try_send(Arc::clone(payload)) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user_id = %recipient, conn_id = %handle.id, "outbound queue full, evicting");
                    evict.push((handle.id.clone(), "queue_full"));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(user_id = %recipient, conn_id = %handle.id, "outbound queue closed, evicting");
                    evict.push((handle.id.clone(), "queue_closed"));
                }
            }
        }

        for (conn_id, reason) in evict {
            if self.remove(recipient, &conn_id).is_some() {
                report.evicted += 1;
                counter!(HUB_EVICTIONS_TOTAL, "reason" => reason).increment(1);
            }
        }
        counter!(HUB_DELIVERIES_TOTAL).increment(report.delivered as u64);
        report
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauge(&self) {
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.total as f64);
    }
}
