//! Per-user durable delivery queues with retry and sync reconciliation.
//!
//! Each user's queue lives behind its own async mutex, so all writes to one
//! queue are serialized while different users proceed in parallel. Every
//! mutation is written through the `QueueStore`, and queues are reloaded
//! lazily on the first touch after a restart.
//!
//! Failed transmits are retried on an exponential schedule driven by
//! abortable timers; the timers emit `RetryDue` on a channel and the
//! dispatcher re-runs the send.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::metrics;
use crate::models::{DraftMessage, QueuedMessage};
use crate::storage::QueueStore;
use crate::{Error, Result};
use pulse_proto::{MessageId, MessageStatus, ServerMessageId, SyncConflict, SyncEntry, UserId};

/// Emitted on the retry channel when a backoff timer elapses
#[derive(Debug, Clone)]
pub struct RetryDue {
    pub user: UserId,
    pub message_id: MessageId,
}

/// Result of one send attempt
#[derive(Debug)]
pub enum SendOutcome {
    /// Transmit succeeded; the message carries its server id
    Sent(QueuedMessage),
    /// Transmit failed, a retry is scheduled
    Scheduled { retry_in: Duration, attempt: u32 },
    /// Transmit failed and the retry bound is exhausted
    Failed,
    /// Nothing to do: already acknowledged, already in flight, or gone
    Skipped,
}

/// Retry posture, chosen from recent send statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryProfile {
    Normal,
    /// Slow but reliable link: more patience per attempt
    HighLatency,
    /// Mostly failing or offline: fewer wasted attempts, wider gaps
    Degraded,
}

/// How the sender wants a reported conflict settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    KeepLocal,
    AcceptRemote,
}

/// Result of reconciling a client's sync snapshot
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub applied: Vec<MessageId>,
    pub conflicts: Vec<SyncConflict>,
    pub unchanged: u32,
}

#[derive(Debug, Default)]
struct SendStats {
    attempts: u64,
    failures: u64,
    successes: u64,
    latency_total: Duration,
    offline: bool,
}

impl SendStats {
    fn record_success(&mut self, latency: Duration) {
        self.attempts += 1;
        self.successes += 1;
        self.latency_total += latency;
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
        self.failures += 1;
    }

    fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.successes == 0 {
            None
        } else {
            Some(self.latency_total / u32::try_from(self.successes).unwrap_or(u32::MAX))
        }
    }
}

struct UserQueue {
    messages: Vec<QueuedMessage>,
    stats: SendStats,
}

/// Durable per-user outbound message queue
pub struct DeliveryService {
    store: Arc<dyn QueueStore>,
    queues: DashMap<UserId, Arc<Mutex<UserQueue>>>,
    /// Message id -> owning user, for operations addressed by message id
    owners: DashMap<MessageId, UserId>,
    retry_timers: DashMap<MessageId, JoinHandle<()>>,
    retry_tx: mpsc::UnboundedSender<RetryDue>,
    config: DeliveryConfig,
}

impl DeliveryService {
    /// Create the service and the channel on which due retries arrive
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: DeliveryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RetryDue>) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                queues: DashMap::new(),
                owners: DashMap::new(),
                retry_timers: DashMap::new(),
                retry_tx,
                config,
            },
            retry_rx,
        )
    }

    /// Fetch a user's queue, loading the persisted snapshot on first touch
    async fn queue_for(&self, user: UserId) -> Result<Arc<Mutex<UserQueue>>> {
        if let Some(queue) = self.queues.get(&user) {
            return Ok(Arc::clone(&queue));
        }
        let recovered = self.store.load(user).await?;
        for msg in &recovered {
            self.owners.insert(msg.id.clone(), user);
        }
        let queue = Arc::clone(
            self.queues
                .entry(user)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(UserQueue {
                        messages: recovered,
                        stats: SendStats::default(),
                    }))
                })
                .value(),
        );
        Ok(queue)
    }

    /// Validate and enqueue a draft. The message is durable once this
    /// returns; transmission happens separately.
    pub async fn enqueue(&self, user: UserId, draft: DraftMessage) -> Result<QueuedMessage> {
        if draft.content.trim().is_empty() && draft.media.is_empty() {
            return Err(Error::InvalidInput("message has no content".into()));
        }
        if draft.content.chars().count() > self.config.max_content_length {
            return Err(Error::InvalidInput(format!(
                "message exceeds {} characters",
                self.config.max_content_length
            )));
        }

        let queue = self.queue_for(user).await?;
        let mut q = queue.lock().await;
        let message = QueuedMessage::new(user, draft);
        q.messages.push(message.clone());
        self.owners.insert(message.id.clone(), user);
        self.store.save(user, &q.messages).await?;
        metrics::MESSAGES_TOTAL.with_label_values(&["queued"]).inc();
        debug!(user = %user, message_id = %message.id, "Message queued");
        Ok(message)
    }

    /// Attempt delivery of a queued message.
    ///
    /// `transmit` performs the actual persistence + fan-out and returns the
    /// server-assigned id. Re-sending an already acknowledged or in-flight
    /// message is a no-op, so a duplicate attempt never produces a second
    /// broadcast.
    pub async fn send<F, Fut>(
        &self,
        user: UserId,
        message_id: &MessageId,
        transmit: F,
    ) -> Result<SendOutcome>
    where
        F: FnOnce(QueuedMessage) -> Fut + Send,
        Fut: Future<Output = Result<ServerMessageId>> + Send,
    {
        let queue = self.queue_for(user).await?;

        // Claim the message for this attempt
        let outbound = {
            let mut q = queue.lock().await;
            let msg = q
                .messages
                .iter_mut()
                .find(|m| m.id == *message_id)
                .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
            if msg.status.is_acknowledged() || !msg.advance(MessageStatus::Sending) {
                return Ok(SendOutcome::Skipped);
            }
            let snapshot = msg.clone();
            self.store.save(user, &q.messages).await?;
            snapshot
        };

        let started = Instant::now();
        let result = transmit(outbound).await;

        let mut q = queue.lock().await;
        match result {
            Ok(server_id) => {
                q.stats.record_success(started.elapsed());
                let Some(msg) = q.messages.iter_mut().find(|m| m.id == *message_id) else {
                    // Deleted while in flight
                    return Ok(SendOutcome::Skipped);
                };
                msg.server_id = Some(server_id);
                msg.advance(MessageStatus::Sent);
                self.cancel_retry(message_id);
                let sent = msg.clone();
                self.store.save(user, &q.messages).await?;
                metrics::MESSAGES_TOTAL.with_label_values(&["sent"]).inc();
                info!(user = %user, message_id = %message_id, "Message sent");
                Ok(SendOutcome::Sent(sent))
            }
            Err(err) => {
                q.stats.record_failure();
                let profile = self.profile_of(&q.stats);
                let (max_retries, factor) = self.profile_params(profile);
                let Some(msg) = q.messages.iter_mut().find(|m| m.id == *message_id) else {
                    return Ok(SendOutcome::Skipped);
                };
                msg.advance(MessageStatus::Failed);
                msg.retry_count += 1;
                let attempt = msg.retry_count;
                self.store.save(user, &q.messages).await?;
                drop(q);

                if attempt > max_retries {
                    metrics::MESSAGES_TOTAL.with_label_values(&["failed"]).inc();
                    warn!(
                        user = %user,
                        message_id = %message_id,
                        attempt,
                        error = %err,
                        "Delivery abandoned, retries exhausted"
                    );
                    Ok(SendOutcome::Failed)
                } else {
                    let retry_in = self.backoff_delay(attempt, factor);
                    self.schedule_retry(user, message_id.clone(), retry_in);
                    metrics::DELIVERY_RETRIES.inc();
                    debug!(
                        user = %user,
                        message_id = %message_id,
                        attempt,
                        retry_in_ms = retry_in.as_millis() as u64,
                        profile = ?profile,
                        error = %err,
                        "Delivery failed, retry scheduled"
                    );
                    Ok(SendOutcome::Scheduled { retry_in, attempt })
                }
            }
        }
    }

    /// delay = initial * factor^(attempt-1), capped at the configured max
    fn backoff_delay(&self, attempt: u32, factor: f64) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1).min(16)).unwrap_or(16);
        let ms = self.config.initial_delay_ms as f64 * factor.powi(exp);
        Duration::from_millis(ms.min(self.config.max_delay_ms as f64) as u64)
    }

    fn profile_params(&self, profile: RetryProfile) -> (u32, f64) {
        let cfg = &self.config;
        match profile {
            RetryProfile::Normal => (cfg.max_retries, cfg.backoff_factor),
            RetryProfile::HighLatency => (
                cfg.max_retries + cfg.high_latency_extra_retries,
                cfg.backoff_factor * cfg.high_latency_backoff_multiplier,
            ),
            RetryProfile::Degraded => (
                cfg.max_retries + cfg.degraded_extra_retries,
                cfg.backoff_factor * cfg.degraded_backoff_multiplier,
            ),
        }
    }

    fn profile_of(&self, stats: &SendStats) -> RetryProfile {
        if stats.offline {
            return RetryProfile::Degraded;
        }
        if stats.attempts < u64::from(self.config.min_samples) {
            return RetryProfile::Normal;
        }
        if stats.failure_rate() > self.config.degraded_failure_rate {
            return RetryProfile::Degraded;
        }
        if stats
            .average_latency()
            .is_some_and(|avg| avg > Duration::from_millis(self.config.high_latency_ms))
        {
            return RetryProfile::HighLatency;
        }
        RetryProfile::Normal
    }

    /// The retry posture currently in effect for a user
    pub async fn current_profile(&self, user: UserId) -> Result<RetryProfile> {
        let queue = self.queue_for(user).await?;
        let q = queue.lock().await;
        Ok(self.profile_of(&q.stats))
    }

    /// Record a hint that the user's device reported itself offline;
    /// widens retry spacing until cleared
    pub async fn set_offline(&self, user: UserId, offline: bool) -> Result<()> {
        let queue = self.queue_for(user).await?;
        let mut q = queue.lock().await;
        q.stats.offline = offline;
        Ok(())
    }

    fn schedule_retry(&self, user: UserId, message_id: MessageId, delay: Duration) {
        self.cancel_retry(&message_id);
        let tx = self.retry_tx.clone();
        let id = message_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RetryDue {
                user,
                message_id: id,
            });
        });
        self.retry_timers.insert(message_id, handle);
    }

    fn cancel_retry(&self, message_id: &MessageId) {
        if let Some((_, handle)) = self.retry_timers.remove(message_id) {
            handle.abort();
        }
    }

    /// Apply a status transition reported out of band (delivery receipt,
    /// read receipt, server acknowledgment seen through sync).
    ///
    /// Returns `true` when the status actually changed; regressions and
    /// repeats are no-ops. Reaching `sent` or beyond cancels any pending
    /// retry.
    pub async fn mark(
        &self,
        user: UserId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<bool> {
        let queue = self.queue_for(user).await?;
        let mut q = queue.lock().await;
        let msg = q
            .messages
            .iter_mut()
            .find(|m| m.id == *message_id)
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
        let changed = msg.advance(status);
        if status.is_acknowledged() || status.rank() >= MessageStatus::Sent.rank() {
            self.cancel_retry(message_id);
        }
        if changed {
            self.store.save(user, &q.messages).await?;
            debug!(user = %user, message_id = %message_id, status = status.as_str(), "Status advanced");
        }
        Ok(changed)
    }

    /// Reconcile a client's sync snapshot against the local queue.
    ///
    /// Entries match by client id first, then message id. Higher remote
    /// version wins; equal versions are already in sync; a lower remote
    /// version keeps the local copy and reports a conflict for the client
    /// to resolve. Either way the entry's sync timestamp advances so the
    /// same divergence is not re-reported forever.
    pub async fn sync(&self, user: UserId, entries: Vec<SyncEntry>) -> Result<SyncOutcome> {
        let queue = self.queue_for(user).await?;
        let mut q = queue.lock().await;
        let mut outcome = SyncOutcome::default();

        for entry in entries {
            let local = q.messages.iter_mut().find(|m| {
                entry
                    .client_id
                    .as_ref()
                    .is_some_and(|cid| m.client_id == *cid)
                    || entry.message_id.as_ref().is_some_and(|mid| m.id == *mid)
            });
            let Some(local) = local else {
                // Unknown to this queue; nothing to reconcile
                outcome.unchanged += 1;
                continue;
            };

            if entry.version > local.version {
                local.apply_remote(entry.content, entry.version, entry.status);
                outcome.applied.push(local.id.clone());
            } else if entry.version == local.version {
                local.last_synced_at = Some(chrono::Utc::now());
                outcome.unchanged += 1;
            } else {
                outcome.conflicts.push(SyncConflict {
                    message_id: local.id.clone(),
                    local_version: local.version,
                    remote_version: entry.version,
                });
                // Local copy kept; advance the sync point regardless
                local.last_synced_at = Some(chrono::Utc::now());
            }
        }

        self.store.save(user, &q.messages).await?;
        info!(
            user = %user,
            applied = outcome.applied.len(),
            conflicts = outcome.conflicts.len(),
            unchanged = outcome.unchanged,
            "Sync reconciled"
        );
        Ok(outcome)
    }

    /// Settle a previously reported conflict. The winning copy's version is
    /// bumped past both sides so the next sync converges.
    pub async fn resolve_conflict(
        &self,
        user: UserId,
        message_id: &MessageId,
        resolution: ConflictResolution,
        remote: SyncEntry,
    ) -> Result<QueuedMessage> {
        let queue = self.queue_for(user).await?;
        let mut q = queue.lock().await;
        let msg = q
            .messages
            .iter_mut()
            .find(|m| m.id == *message_id)
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;

        let next_version = msg.version.max(remote.version) + 1;
        match resolution {
            ConflictResolution::KeepLocal => {}
            ConflictResolution::AcceptRemote => {
                msg.content = remote.content;
                if msg.status.rank() < remote.status.rank() {
                    msg.status = remote.status;
                }
            }
        }
        msg.version = next_version;
        msg.last_synced_at = Some(chrono::Utc::now());
        let resolved = msg.clone();
        self.store.save(user, &q.messages).await?;
        info!(user = %user, message_id = %message_id, resolution = ?resolution, "Conflict resolved");
        Ok(resolved)
    }

    /// Remove a message from its owner's queue (explicit delete or expiry).
    /// Returns the removed copy, if it was still present.
    pub async fn remove(&self, user: UserId, message_id: &MessageId) -> Result<Option<QueuedMessage>> {
        let queue = self.queue_for(user).await?;
        let mut q = queue.lock().await;
        let Some(pos) = q.messages.iter().position(|m| m.id == *message_id) else {
            return Ok(None);
        };
        let removed = q.messages.remove(pos);
        self.cancel_retry(message_id);
        self.owners.remove(message_id);
        self.store.save(user, &q.messages).await?;
        Ok(Some(removed))
    }

    #[must_use]
    pub fn owner_of(&self, message_id: &MessageId) -> Option<UserId> {
        self.owners.get(message_id).map(|owner| *owner)
    }

    pub async fn get(&self, user: UserId, message_id: &MessageId) -> Result<Option<QueuedMessage>> {
        let queue = self.queue_for(user).await?;
        let q = queue.lock().await;
        Ok(q.messages.iter().find(|m| m.id == *message_id).cloned())
    }

    pub async fn snapshot(&self, user: UserId) -> Result<Vec<QueuedMessage>> {
        let queue = self.queue_for(user).await?;
        let q = queue.lock().await;
        Ok(q.messages.clone())
    }

    /// Abort all pending retry timers. Queue contents are already durable.
    pub fn shutdown(&self) {
        for entry in self.retry_timers.iter() {
            entry.value().abort();
        }
        self.retry_timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryQueueStore;
    use pulse_proto::{ClientId, RoomId};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> (DeliveryService, mpsc::UnboundedReceiver<RetryDue>) {
        DeliveryService::new(Arc::new(MemoryQueueStore::new()), DeliveryConfig::default())
    }

    fn draft(client_id: &str) -> DraftMessage {
        DraftMessage {
            room_id: RoomId::from("r1"),
            client_id: ClientId::from(client_id),
            content: "hello".to_string(),
            media: Vec::new(),
            ttl_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_validates_content() {
        let (service, _rx) = service();
        let user = UserId::new(1);

        let mut empty = draft("c1");
        empty.content = "   ".to_string();
        assert!(matches!(
            service.enqueue(user, empty).await,
            Err(Error::InvalidInput(_))
        ));

        let mut long = draft("c2");
        long.content = "x".repeat(5000);
        assert!(matches!(
            service.enqueue(user, long).await,
            Err(Error::InvalidInput(_))
        ));

        let msg = service.enqueue(user, draft("c3")).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(service.owner_of(&msg.id), Some(user));
    }

    #[tokio::test]
    async fn test_send_success_records_server_id() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let outcome = service
            .send(user, &msg.id, |_m| async { Ok(ServerMessageId::from("s1")) })
            .await
            .unwrap();
        match outcome {
            SendOutcome::Sent(sent) => {
                assert_eq!(sent.status, MessageStatus::Sent);
                assert_eq!(sent.server_id, Some(ServerMessageId::from("s1")));
            }
            other => panic!("expected Sent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_send_is_skipped() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        service
            .send(user, &msg.id, move |_m| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(ServerMessageId::from("s1"))
            })
            .await
            .unwrap();

        let c = Arc::clone(&calls);
        let outcome = service
            .send(user, &msg.id, move |_m| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(ServerMessageId::from("s2"))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, SendOutcome::Skipped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_exponential_retries() {
        let (service, mut retries) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let outcome = service
            .send(user, &msg.id, |_m| async { Err(Error::Upstream("down".into())) })
            .await
            .unwrap();
        match outcome {
            SendOutcome::Scheduled { retry_in, attempt } => {
                assert_eq!(attempt, 1);
                assert_eq!(retry_in, Duration::from_millis(500));
            }
            other => panic!("expected Scheduled, got {other:?}"),
        }
        let queued = service.get(user, &msg.id).await.unwrap().unwrap();
        assert_eq!(queued.status, MessageStatus::Failed);

        tokio::time::advance(Duration::from_millis(600)).await;
        let due = retries.recv().await.unwrap();
        assert_eq!(due.message_id, msg.id);

        // Second failure doubles the delay
        let outcome = service
            .send(user, &msg.id, |_m| async { Err(Error::Upstream("down".into())) })
            .await
            .unwrap();
        match outcome {
            SendOutcome::Scheduled { retry_in, attempt } => {
                assert_eq!(attempt, 2);
                assert_eq!(retry_in, Duration::from_millis(1000));
            }
            other => panic!("expected Scheduled, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_max_delay() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let (service, _rx) = DeliveryService::new(store, DeliveryConfig::default());
        // attempt 10 would be 500 * 2^9 = 256s without the cap
        assert_eq!(service.backoff_delay(10, 2.0), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_to_failed() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let config = DeliveryConfig {
            max_retries: 1,
            ..DeliveryConfig::default()
        };
        let (service, _rx) = DeliveryService::new(store, config);
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let first = service
            .send(user, &msg.id, |_m| async { Err(Error::Upstream("down".into())) })
            .await
            .unwrap();
        assert!(matches!(first, SendOutcome::Scheduled { .. }));

        let second = service
            .send(user, &msg.id, |_m| async { Err(Error::Upstream("down".into())) })
            .await
            .unwrap();
        assert!(matches!(second, SendOutcome::Failed));
        let queued = service.get(user, &msg.id).await.unwrap().unwrap();
        assert_eq!(queued.status, MessageStatus::Failed);
        assert_eq!(queued.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_cancels_pending_retry() {
        let (service, mut retries) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        service
            .send(user, &msg.id, |_m| async { Err(Error::Upstream("blip".into())) })
            .await
            .unwrap();
        // Manual retry succeeds before the timer fires
        service
            .send(user, &msg.id, |_m| async { Ok(ServerMessageId::from("s1")) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(retries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mark_ladder_is_idempotent() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();
        service
            .send(user, &msg.id, |_m| async { Ok(ServerMessageId::from("s1")) })
            .await
            .unwrap();

        assert!(service.mark(user, &msg.id, MessageStatus::Delivered).await.unwrap());
        assert!(service.mark(user, &msg.id, MessageStatus::Read).await.unwrap());
        // Repeats and regressions change nothing
        assert!(!service.mark(user, &msg.id, MessageStatus::Read).await.unwrap());
        assert!(!service.mark(user, &msg.id, MessageStatus::Delivered).await.unwrap());
        let queued = service.get(user, &msg.id).await.unwrap().unwrap();
        assert_eq!(queued.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_sync_higher_version_wins() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let outcome = service
            .sync(
                user,
                vec![SyncEntry {
                    message_id: None,
                    client_id: Some(ClientId::from("c1")),
                    version: 3,
                    content: "edited".to_string(),
                    status: MessageStatus::Sent,
                    updated_at: chrono::Utc::now(),
                }],
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, vec![msg.id.clone()]);
        let queued = service.get(user, &msg.id).await.unwrap().unwrap();
        assert_eq!(queued.version, 3);
        assert_eq!(queued.content, "edited");
        assert_eq!(queued.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_sync_lower_version_reports_conflict_and_keeps_local() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();
        // Advance local copy past the incoming snapshot
        service
            .sync(
                user,
                vec![SyncEntry {
                    message_id: Some(msg.id.clone()),
                    client_id: None,
                    version: 5,
                    content: "local".to_string(),
                    status: MessageStatus::Pending,
                    updated_at: chrono::Utc::now(),
                }],
            )
            .await
            .unwrap();

        let outcome = service
            .sync(
                user,
                vec![SyncEntry {
                    message_id: Some(msg.id.clone()),
                    client_id: None,
                    version: 2,
                    content: "stale".to_string(),
                    status: MessageStatus::Pending,
                    updated_at: chrono::Utc::now(),
                }],
            )
            .await
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].local_version, 5);
        assert_eq!(outcome.conflicts[0].remote_version, 2);
        let queued = service.get(user, &msg.id).await.unwrap().unwrap();
        assert_eq!(queued.content, "local");
        assert!(queued.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_sync_equal_version_is_unchanged() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let outcome = service
            .sync(
                user,
                vec![SyncEntry {
                    message_id: Some(msg.id.clone()),
                    client_id: None,
                    version: 1,
                    content: "hello".to_string(),
                    status: MessageStatus::Pending,
                    updated_at: chrono::Utc::now(),
                }],
            )
            .await
            .unwrap();
        assert!(outcome.applied.is_empty());
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.unchanged, 1);
    }

    #[tokio::test]
    async fn test_resolve_conflict_bumps_version_past_both() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let remote = SyncEntry {
            message_id: Some(msg.id.clone()),
            client_id: None,
            version: 4,
            content: "remote".to_string(),
            status: MessageStatus::Sent,
            updated_at: chrono::Utc::now(),
        };
        let resolved = service
            .resolve_conflict(user, &msg.id, ConflictResolution::AcceptRemote, remote)
            .await
            .unwrap();
        assert_eq!(resolved.version, 5);
        assert_eq!(resolved.content, "remote");

        let remote = SyncEntry {
            message_id: Some(msg.id.clone()),
            client_id: None,
            version: 2,
            content: "stale".to_string(),
            status: MessageStatus::Pending,
            updated_at: chrono::Utc::now(),
        };
        let resolved = service
            .resolve_conflict(user, &msg.id, ConflictResolution::KeepLocal, remote)
            .await
            .unwrap();
        assert_eq!(resolved.version, 6);
        assert_eq!(resolved.content, "remote");
    }

    #[tokio::test]
    async fn test_queue_recovers_from_store() {
        let store = Arc::new(MemoryQueueStore::new());
        let user = UserId::new(1);
        {
            let (service, _rx) =
                DeliveryService::new(Arc::clone(&store) as Arc<dyn QueueStore>, DeliveryConfig::default());
            service.enqueue(user, draft("c1")).await.unwrap();
        }

        // Fresh service over the same store, as after a restart
        let (service, _rx) =
            DeliveryService::new(store as Arc<dyn QueueStore>, DeliveryConfig::default());
        let messages = service.snapshot(user).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].client_id.as_str(), "c1");
        assert_eq!(service.owner_of(&messages[0].id), Some(user));
    }

    #[tokio::test]
    async fn test_degraded_profile_after_failures() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let config = DeliveryConfig {
            min_samples: 4,
            max_retries: 20,
            ..DeliveryConfig::default()
        };
        let (service, _rx) = DeliveryService::new(store, config);
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        for _ in 0..4 {
            service
                .send(user, &msg.id, |_m| async { Err(Error::Upstream("down".into())) })
                .await
                .unwrap();
        }
        assert_eq!(
            service.current_profile(user).await.unwrap(),
            RetryProfile::Degraded
        );

        // Degraded profile widens the spacing: factor 2.0 * 1.5
        let outcome = service
            .send(user, &msg.id, |_m| async { Err(Error::Upstream("down".into())) })
            .await
            .unwrap();
        match outcome {
            SendOutcome::Scheduled { retry_in, .. } => {
                // attempt 5: 500 * 3^4 = 40.5s, capped at 30s
                assert_eq!(retry_in, Duration::from_secs(30));
            }
            other => panic!("expected Scheduled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_hint_forces_degraded() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        service.set_offline(user, true).await.unwrap();
        assert_eq!(
            service.current_profile(user).await.unwrap(),
            RetryProfile::Degraded
        );
        service.set_offline(user, false).await.unwrap();
        assert_eq!(
            service.current_profile(user).await.unwrap(),
            RetryProfile::Normal
        );
    }

    #[tokio::test]
    async fn test_remove_drops_message_and_index() {
        let (service, _rx) = service();
        let user = UserId::new(1);
        let msg = service.enqueue(user, draft("c1")).await.unwrap();

        let removed = service.remove(user, &msg.id).await.unwrap();
        assert!(removed.is_some());
        assert!(service.owner_of(&msg.id).is_none());
        assert!(service.get(user, &msg.id).await.unwrap().is_none());
        // Second remove is a no-op
        assert!(service.remove(user, &msg.id).await.unwrap().is_none());
    }
}
