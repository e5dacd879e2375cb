//! Ephemeral message expiry.
//!
//! Registrations live in a concurrent map; a periodic sweep collects due
//! records and hands them to the dispatcher over a channel. `DashMap::remove`
//! wins exactly once, so a message that expires while a competing delete is
//! in flight is emitted by at most one of the two.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::metrics;
use pulse_proto::{MessageId, RoomId, UserId};

/// One registered ephemeral message
#[derive(Debug, Clone)]
pub struct EphemeralRecord {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub expires_at: Instant,
}

/// Tracks ephemeral messages and emits them on expiry
pub struct ExpiryService {
    records: Arc<DashMap<MessageId, EphemeralRecord>>,
    sweep_interval: Duration,
    expired_tx: mpsc::UnboundedSender<EphemeralRecord>,
}

impl ExpiryService {
    /// Create the service and the channel on which expired records arrive
    #[must_use]
    pub fn new(sweep_interval: Duration) -> (Self, mpsc::UnboundedReceiver<EphemeralRecord>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Self {
                records: Arc::new(DashMap::new()),
                sweep_interval,
                expired_tx,
            },
            expired_rx,
        )
    }

    /// Register a message for expiry `ttl` from now
    pub fn register(&self, message_id: MessageId, room_id: RoomId, sender: UserId, ttl: Duration) {
        let record = EphemeralRecord {
            message_id: message_id.clone(),
            room_id,
            sender,
            expires_at: Instant::now() + ttl,
        };
        debug!(message_id = %message_id, ttl_secs = ttl.as_secs(), "Ephemeral registered");
        self.records.insert(message_id, record);
    }

    /// Drop a registration (explicit delete raced ahead of the sweep).
    /// Returns `true` when the record was still present.
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        self.records.remove(message_id).is_some()
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Spawn the sweep loop. Runs until aborted.
    #[must_use]
    pub fn start(&self) -> JoinHandle<()> {
        let records = Arc::clone(&self.records);
        let tx = self.expired_tx.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let due: Vec<MessageId> = records
                    .iter()
                    .filter(|entry| entry.expires_at <= now)
                    .map(|entry| entry.key().clone())
                    .collect();
                for message_id in due {
                    // remove() wins exactly once against concurrent deletes
                    if let Some((_, record)) = records.remove(&message_id) {
                        metrics::MESSAGES_EXPIRED.inc();
                        info!(message_id = %record.message_id, room_id = %record.room_id, "Ephemeral expired");
                        if tx.send(record).is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}
