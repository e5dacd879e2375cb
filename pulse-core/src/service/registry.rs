//! Connection registry: live transports and the reconnect grace period.
//!
//! A disconnect does not immediately mean the user is gone. The registry
//! arms an abortable grace timer; a reconnect inside the window aborts it
//! and the user is never reported offline. Epochs guard against a stale
//! timer purging a session that reconnected after the timer fired.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;
use pulse_proto::{ConnectionId, RoomId, ServerEvent, UserId};

/// Outbound transport handle for one connected user
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Emitted on the presence channel when a grace timer fires
#[derive(Debug, Clone, Copy)]
pub struct PresenceTimeout {
    pub user: UserId,
    pub epoch: u64,
}

/// How a connect related to the user's previous state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// User was fully offline
    Fresh,
    /// User was inside the reconnect grace period
    Reconnected,
    /// User was already online; the old transport handle was replaced
    Replaced,
}

struct Connection {
    sender: EventSender,
    connection_id: ConnectionId,
    /// Bumped on every connect and disconnect; a grace timer only purges
    /// when its captured epoch still matches
    epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
    /// Last typing broadcast per room, for throttling
    typing: HashMap<RoomId, Instant>,
}

/// Registry of connected users and their transport handles
pub struct ConnectionRegistry {
    entries: Arc<DashMap<UserId, Connection>>,
    grace_period: Duration,
    typing_throttle: Duration,
    timeout_tx: mpsc::UnboundedSender<PresenceTimeout>,
}

impl ConnectionRegistry {
    /// Create the registry and the channel on which grace timeouts arrive
    #[must_use]
    pub fn new(
        grace_period: Duration,
        typing_throttle: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceTimeout>) {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: Arc::new(DashMap::new()),
                grace_period,
                typing_throttle,
                timeout_tx,
            },
            timeout_rx,
        )
    }

    /// Register a verified user's transport.
    ///
    /// Aborts any pending grace timer; a second connect for an already
    /// online user replaces the handle, last writer wins.
    pub fn connect(
        &self,
        user: UserId,
        connection_id: ConnectionId,
        sender: EventSender,
    ) -> ConnectOutcome {
        match self.entries.entry(user) {
            dashmap::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let outcome = if let Some(timer) = entry.grace_timer.take() {
                    timer.abort();
                    ConnectOutcome::Reconnected
                } else {
                    ConnectOutcome::Replaced
                };
                entry.epoch += 1;
                entry.sender = sender;
                entry.connection_id = connection_id;
                info!(user = %user, outcome = ?outcome, "Connection registered");
                outcome
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(Connection {
                    sender,
                    connection_id,
                    epoch: 0,
                    grace_timer: None,
                    typing: HashMap::new(),
                });
                metrics::ACTIVE_CONNECTIONS.inc();
                info!(user = %user, "Connection registered");
                ConnectOutcome::Fresh
            }
        }
    }

    /// Handle a transport drop. Arms the grace timer; presence is only
    /// reported lost when the timer fires without a reconnect.
    ///
    /// A disconnect from a transport that has already been replaced is
    /// ignored.
    pub fn disconnect(&self, user: UserId, connection_id: &ConnectionId) {
        let Some(mut entry) = self.entries.get_mut(&user) else {
            return;
        };
        if entry.connection_id != *connection_id {
            debug!(user = %user, "Stale disconnect from replaced transport, ignoring");
            return;
        }
        entry.epoch += 1;
        let epoch = entry.epoch;
        if let Some(previous) = entry.grace_timer.take() {
            previous.abort();
        }

        let grace = self.grace_period;
        let tx = self.timeout_tx.clone();
        entry.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(PresenceTimeout { user, epoch });
        }));
        debug!(user = %user, grace_secs = grace.as_secs(), "Grace timer armed");
    }

    /// Purge the user if the timeout's epoch is still current.
    /// Returns `true` when the user was actually removed.
    pub fn purge_if_expired(&self, timeout: PresenceTimeout) -> bool {
        let Some(entry) = self.entries.get(&timeout.user) else {
            return false;
        };
        if entry.epoch != timeout.epoch || entry.grace_timer.is_none() {
            // Reconnected (or a newer disconnect re-armed the timer)
            return false;
        }
        drop(entry);

        if self.entries.remove(&timeout.user).is_some() {
            metrics::ACTIVE_CONNECTIONS.dec();
            info!(user = %timeout.user, "Grace period elapsed, presence purged");
            true
        } else {
            false
        }
    }

    /// Whether the user currently has a live transport.
    /// A user inside the grace period is still "online" but unreachable.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.entries.contains_key(&user)
    }

    /// Whether the user is inside the reconnect grace period
    #[must_use]
    pub fn in_grace_period(&self, user: UserId) -> bool {
        self.entries
            .get(&user)
            .is_some_and(|entry| entry.grace_timer.is_some())
    }

    /// Deliver an event to a user's live transport. Returns `false` when
    /// the user is offline, in the grace period, or the channel is closed.
    pub fn send_to(&self, user: UserId, event: ServerEvent) -> bool {
        let Some(entry) = self.entries.get(&user) else {
            return false;
        };
        if entry.grace_timer.is_some() {
            return false;
        }
        if entry.sender.send(event).is_err() {
            warn!(user = %user, "Transport channel closed, event dropped");
            return false;
        }
        true
    }

    /// Throttled typing gate: `true` at most once per throttle interval
    /// per user per room.
    pub fn note_typing(&self, user: UserId, room_id: &RoomId) -> bool {
        let Some(mut entry) = self.entries.get_mut(&user) else {
            return false;
        };
        let now = Instant::now();
        match entry.typing.get(room_id) {
            Some(last) if now.duration_since(*last) < self.typing_throttle => false,
            _ => {
                entry.typing.insert(room_id.clone(), now);
                true
            }
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    /// Abort all pending grace timers and drop every entry
    pub fn shutdown(&self) {
        for mut entry in self.entries.iter_mut() {
            if let Some(timer) = entry.grace_timer.take() {
                timer.abort();
            }
        }
        self.entries.clear();
        metrics::ACTIVE_CONNECTIONS.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ConnectionRegistry, mpsc::UnboundedReceiver<PresenceTimeout>) {
        ConnectionRegistry::new(Duration::from_secs(30), Duration::from_secs(2))
    }

    fn transport() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timer_fires_after_window() {
        let (registry, mut timeouts) = registry();
        let user = UserId::new(1);
        let conn = ConnectionId::new();
        let (tx, _rx) = transport();

        assert_eq!(registry.connect(user, conn.clone(), tx), ConnectOutcome::Fresh);
        registry.disconnect(user, &conn);
        assert!(registry.in_grace_period(user));

        tokio::time::advance(Duration::from_secs(31)).await;
        let timeout = timeouts.recv().await.unwrap();
        assert_eq!(timeout.user, user);
        assert!(registry.purge_if_expired(timeout));
        assert!(!registry.is_online(user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_inside_grace_aborts_timer() {
        let (registry, mut timeouts) = registry();
        let user = UserId::new(1);
        let conn = ConnectionId::new();
        let (tx, _rx) = transport();

        registry.connect(user, conn.clone(), tx);
        registry.disconnect(user, &conn);

        tokio::time::advance(Duration::from_secs(29)).await;
        let (tx2, _rx2) = transport();
        let outcome = registry.connect(user, ConnectionId::new(), tx2);
        assert_eq!(outcome, ConnectOutcome::Reconnected);

        // The aborted timer never delivers a timeout
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(timeouts.try_recv().is_err());
        assert!(registry.is_online(user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_epoch_does_not_purge() {
        let (registry, mut timeouts) = registry();
        let user = UserId::new(1);
        let conn = ConnectionId::new();
        let (tx, _rx) = transport();

        registry.connect(user, conn.clone(), tx);
        registry.disconnect(user, &conn);
        tokio::time::advance(Duration::from_secs(31)).await;
        let stale = timeouts.recv().await.unwrap();

        // Reconnect lands after the timer fired but before the purge ran
        let (tx2, _rx2) = transport();
        registry.connect(user, ConnectionId::new(), tx2);

        assert!(!registry.purge_if_expired(stale));
        assert!(registry.is_online(user));
    }

    #[tokio::test]
    async fn test_second_connect_replaces_transport() {
        let (registry, _timeouts) = registry();
        let user = UserId::new(1);
        let (tx1, mut rx1) = transport();
        let (tx2, mut rx2) = transport();

        registry.connect(user, ConnectionId::new(), tx1);
        let outcome = registry.connect(user, ConnectionId::new(), tx2);
        assert_eq!(outcome, ConnectOutcome::Replaced);

        let event = ServerEvent::UserOnline {
            room_id: RoomId::from("r1"),
            user,
        };
        assert!(registry.send_to(user, event));
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let (registry, _timeouts) = registry();
        let user = UserId::new(1);
        let old_conn = ConnectionId::new();
        let (tx1, _rx1) = transport();
        let (tx2, _rx2) = transport();

        registry.connect(user, old_conn.clone(), tx1);
        registry.connect(user, ConnectionId::new(), tx2);

        // The replaced transport's deferred disconnect must not arm a timer
        registry.disconnect(user, &old_conn);
        assert!(!registry.in_grace_period(user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_during_grace_period_fails() {
        let (registry, _timeouts) = registry();
        let user = UserId::new(1);
        let conn = ConnectionId::new();
        let (tx, _rx) = transport();

        registry.connect(user, conn.clone(), tx);
        registry.disconnect(user, &conn);
        let event = ServerEvent::UserOnline {
            room_id: RoomId::from("r1"),
            user,
        };
        assert!(!registry.send_to(user, event));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_throttle() {
        let (registry, _timeouts) = registry();
        let user = UserId::new(1);
        let room = RoomId::from("r1");
        let (tx, _rx) = transport();
        registry.connect(user, ConnectionId::new(), tx);

        assert!(registry.note_typing(user, &room));
        assert!(!registry.note_typing(user, &room));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(registry.note_typing(user, &room));
    }
}
