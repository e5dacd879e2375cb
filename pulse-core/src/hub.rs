//! The realtime hub: composition root and event dispatcher.
//!
//! Owns every service plus the upstream collaborators, translates inbound
//! client events into service calls, and runs the background loops that
//! consume presence timeouts, due retries, and expired ephemerals. All
//! cross-service cascades (call teardown on room deletion, presence purge
//! on grace expiry) live here so the services never call each other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::DraftMessage;
use crate::service::{
    Action, CallCoordinator, ConnectOutcome, ConnectionRegistry, DeliveryService,
    DepartureOutcome, EphemeralRecord, EventSender, ExpiryService, PresenceTimeout, RateLimiter,
    RetryDue, RoomDirectory, SendOutcome, StateEffect,
};
use crate::storage::QueueStore;
use crate::upstream::{
    CredentialVerifier, MediaVariantResolver, MembershipSource, MessagePersistence, RelayControl,
};
use crate::{Error, Result};
use pulse_proto::{
    CallId, CallMode, CallState, ClientEvent, ConnectionId, MediaConstraints, MediaRef, MediaType,
    MessageId, MessageStatus, PeerConnectionState, QualityStats, RejectReason, RoomId, RoomKind,
    ServerEvent, SignalPayload, SyncEntry, UserId,
};

/// The collaborators owned by the surrounding backend
pub struct Upstreams {
    pub credentials: Arc<dyn CredentialVerifier>,
    pub persistence: Arc<dyn MessagePersistence>,
    pub media: Arc<dyn MediaVariantResolver>,
    pub membership: Arc<dyn MembershipSource>,
    pub relay: Arc<dyn RelayControl>,
}

/// Composition root for the realtime core
pub struct RealtimeHub {
    pub registry: ConnectionRegistry,
    pub rooms: RoomDirectory,
    pub limiter: RateLimiter,
    pub delivery: DeliveryService,
    pub calls: CallCoordinator,
    pub expiry: ExpiryService,
    upstreams: Upstreams,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    presence_rx: Mutex<Option<mpsc::UnboundedReceiver<PresenceTimeout>>>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RetryDue>>>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<EphemeralRecord>>>,
}

impl RealtimeHub {
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn QueueStore>, upstreams: Upstreams) -> Arc<Self> {
        let (registry, presence_rx) =
            ConnectionRegistry::new(config.grace_period(), config.typing_throttle());
        let (delivery, retry_rx) = DeliveryService::new(store, config.delivery.clone());
        let (expiry, expired_rx) = ExpiryService::new(config.sweep_interval());

        Arc::new(Self {
            registry,
            rooms: RoomDirectory::new(),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            delivery,
            calls: CallCoordinator::new(config.call.clone()),
            expiry,
            upstreams,
            tasks: Mutex::new(Vec::new()),
            presence_rx: Mutex::new(Some(presence_rx)),
            retry_rx: Mutex::new(Some(retry_rx)),
            expired_rx: Mutex::new(Some(expired_rx)),
        })
    }

    /// Spawn the background loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.expiry.start());

        if let Some(mut rx) = self.presence_rx.lock().take() {
            let hub = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(timeout) = rx.recv().await {
                    hub.handle_presence_timeout(timeout).await;
                }
            }));
        }
        if let Some(mut rx) = self.retry_rx.lock().take() {
            let hub = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(due) = rx.recv().await {
                    if let Err(err) = hub.deliver(due.user, &due.message_id).await {
                        warn!(user = %due.user, message_id = %due.message_id, error = %err, "Retry delivery failed");
                    }
                }
            }));
        }
        if let Some(mut rx) = self.expired_rx.lock().take() {
            let hub = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    hub.handle_expired(record).await;
                }
            }));
        }
        info!("Realtime hub started");
    }

    /// Stop background loops, end live calls, and release resources.
    /// Queued messages are already durable and survive to the next start.
    pub async fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        for session in self.calls.drain_all() {
            if session.mode == CallMode::Relay {
                if let Err(err) = self.upstreams.relay.teardown(&session.id).await {
                    warn!(call_id = %session.id, error = %err, "Relay teardown failed");
                }
            }
            let event = ServerEvent::CallEnded {
                call_id: session.id.clone(),
                room_id: session.room_id.clone(),
            };
            for user in &session.joined {
                self.registry.send_to(*user, event.clone());
            }
        }
        self.delivery.shutdown();
        self.registry.shutdown();
        info!("Realtime hub stopped");
    }

    // ---- connection lifecycle ----

    /// Verify a credential and register the transport. Presence events go
    /// to the rooms the user is in; replacing an already live transport is
    /// silent.
    pub async fn handle_connect(
        &self,
        token: &str,
        connection_id: ConnectionId,
        sender: EventSender,
    ) -> Result<UserId> {
        let user = self.upstreams.credentials.verify_connection(token).await?;
        let outcome = self.registry.connect(user, connection_id, sender);
        match outcome {
            ConnectOutcome::Fresh => self.broadcast_presence(user, false),
            ConnectOutcome::Reconnected => self.broadcast_presence(user, true),
            ConnectOutcome::Replaced => {}
        }
        Ok(user)
    }

    fn broadcast_presence(&self, user: UserId, reconnected: bool) {
        for room_id in self.rooms.rooms_of(user) {
            let event = if reconnected {
                ServerEvent::UserReconnected {
                    room_id: room_id.clone(),
                    user,
                }
            } else {
                ServerEvent::UserOnline {
                    room_id: room_id.clone(),
                    user,
                }
            };
            self.broadcast_room(&room_id, event, Some(user));
        }
    }

    /// The transport dropped; presence survives until the grace timer fires
    pub fn handle_disconnect(&self, user: UserId, connection_id: &ConnectionId) {
        self.registry.disconnect(user, connection_id);
    }

    async fn handle_presence_timeout(&self, timeout: PresenceTimeout) {
        if !self.registry.purge_if_expired(timeout) {
            return;
        }
        self.purge_user(timeout.user).await;
    }

    /// Full departure cascade for a user whose presence is gone: call
    /// slots first, then room membership.
    async fn purge_user(&self, user: UserId) {
        for outcome in self.calls.remove_participant_everywhere(user) {
            self.finish_call_departure(user, outcome).await;
        }
        for (room_id, outcome) in self.rooms.remove_user_everywhere(user) {
            for member in &outcome.remaining {
                self.registry.send_to(
                    *member,
                    ServerEvent::UserLeft {
                        room_id: room_id.clone(),
                        user,
                    },
                );
            }
            if let Some(call_id) = outcome.orphaned_call {
                self.teardown_call(&call_id).await;
            }
        }
    }

    // ---- event dispatch ----

    /// Handle one inbound event, reporting failures back to the actor so
    /// the client never sees silence.
    pub async fn dispatch(&self, user: UserId, event: ClientEvent) {
        let name = event.name();
        if let Err(err) = self.handle_event(user, event).await {
            warn!(user = %user, event = name, error = %err, "Event rejected");
            let response = match &err {
                Error::RateLimited { retry_after } => ServerEvent::RateLimited {
                    action: name.to_string(),
                    retry_after_seconds: retry_after.as_secs().max(1),
                },
                _ => ServerEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.retryable(),
                },
            };
            self.registry.send_to(user, response);
        }
    }

    /// Typed dispatch; errors propagate to the caller
    pub async fn handle_event(&self, user: UserId, event: ClientEvent) -> Result<()> {
        debug!(user = %user, event = event.name(), "Dispatching event");
        match event {
            ClientEvent::PresenceJoin { room_id, kind } => {
                self.presence_join(user, room_id, kind).await
            }
            ClientEvent::PresenceLeave { room_id } => self.presence_leave(user, &room_id).await,
            ClientEvent::MessageSend {
                room_id,
                client_id,
                content,
                media,
                ttl_seconds,
            } => {
                let draft = DraftMessage {
                    room_id,
                    client_id,
                    content,
                    media,
                    ttl_seconds,
                };
                self.message_send(user, draft).await
            }
            ClientEvent::MessageRetry { message_id } => self.message_retry(user, &message_id).await,
            ClientEvent::MessageSync { entries } => self.message_sync(user, entries).await,
            ClientEvent::MessageTyping { room_id } => self.message_typing(user, &room_id),
            ClientEvent::MessageRead {
                room_id,
                message_id,
            } => self.message_read(user, &room_id, &message_id).await,
            ClientEvent::MessageDelete {
                room_id,
                message_id,
            } => self.message_delete(user, &room_id, &message_id).await,
            ClientEvent::CallStart {
                room_id,
                media_type,
                participants,
            } => self.call_start(user, &room_id, media_type, participants).await,
            ClientEvent::CallAccept { call_id } => self.call_accept(user, &call_id),
            ClientEvent::CallReject { call_id, reason } => {
                self.call_reject(user, &call_id, reason).await
            }
            ClientEvent::CallSignal {
                call_id,
                to,
                payload,
            } => self.call_signal(user, &call_id, to, payload),
            ClientEvent::CallConnectionState { call_id, state } => {
                self.call_connection_state(user, &call_id, state)
            }
            ClientEvent::CallQuality { call_id, stats } => {
                self.call_quality(user, &call_id, stats)
            }
        }
    }

    // ---- presence / rooms ----

    async fn presence_join(&self, user: UserId, room_id: RoomId, kind: RoomKind) -> Result<()> {
        if !self.upstreams.membership.is_member(&room_id, user).await? {
            return Err(Error::Authorization(format!(
                "{user} is not a member of conversation {room_id}"
            )));
        }
        let outcome = self.rooms.join(&room_id, user, kind);
        if outcome.joined {
            self.broadcast_room(
                &room_id,
                ServerEvent::UserOnline {
                    room_id: room_id.clone(),
                    user,
                },
                Some(user),
            );
        }
        Ok(())
    }

    async fn presence_leave(&self, user: UserId, room_id: &RoomId) -> Result<()> {
        // Release the user's call slot in this room first
        if let Some(session) = self.calls.session_in_room(room_id) {
            if let Some(outcome) = self.calls.remove_participant(&session.id, user) {
                self.finish_call_departure(user, outcome).await;
            }
        }

        let outcome = self.rooms.leave(room_id, user)?;
        for member in &outcome.remaining {
            self.registry.send_to(
                *member,
                ServerEvent::UserLeft {
                    room_id: room_id.clone(),
                    user,
                },
            );
        }
        if let Some(call_id) = outcome.orphaned_call {
            self.teardown_call(&call_id).await;
        }
        Ok(())
    }

    // ---- messaging ----

    async fn message_send(&self, user: UserId, draft: DraftMessage) -> Result<()> {
        self.limiter.check(user, Action::MessageSend)?;
        if !draft.media.is_empty() {
            self.limiter.check(user, Action::MediaUpload)?;
        }
        self.rooms.authorize(&draft.room_id, user)?;

        let message = self.delivery.enqueue(user, draft).await?;
        self.registry.send_to(
            user,
            ServerEvent::Queued {
                message_id: message.id.clone(),
                client_id: message.client_id.clone(),
                room_id: message.room_id.clone(),
            },
        );
        if let Some(ttl) = message.ttl_seconds {
            self.expiry.register(
                message.id.clone(),
                message.room_id.clone(),
                user,
                Duration::from_secs(ttl),
            );
        }
        self.deliver(user, &message.id).await
    }

    /// Run one delivery attempt: persist, resolve media, fan out. Invoked
    /// for the initial send, due retries, and explicit client retries.
    async fn deliver(&self, user: UserId, message_id: &MessageId) -> Result<()> {
        let outcome = self
            .delivery
            .send(user, message_id, |msg| async move {
                // Media resolution runs before the durable append: once the
                // append has happened the attempt must not fail, or a retry
                // would append the same message twice
                let media = self.resolve_media(&msg.media).await?;
                let server_id = self
                    .upstreams
                    .persistence
                    .append_message(&msg.room_id, msg.sender, &msg.content, &msg.media)
                    .await?;
                let event = ServerEvent::ChatMessage {
                    message_id: msg.id.clone(),
                    server_id: Some(server_id.clone()),
                    room_id: msg.room_id.clone(),
                    sender: msg.sender,
                    content: msg.content.clone(),
                    media,
                    sent_at: msg.created_at,
                };
                self.broadcast_room(&msg.room_id, event, Some(msg.sender));
                Ok(server_id)
            })
            .await?;

        match outcome {
            SendOutcome::Sent(sent) => {
                self.registry.send_to(
                    user,
                    ServerEvent::MessageStatus {
                        message_id: sent.id,
                        status: MessageStatus::Sent,
                        reason: None,
                    },
                );
            }
            SendOutcome::Failed => {
                self.registry.send_to(
                    user,
                    ServerEvent::MessageStatus {
                        message_id: message_id.clone(),
                        status: MessageStatus::Failed,
                        reason: Some("delivery retries exhausted".to_string()),
                    },
                );
            }
            SendOutcome::Scheduled { .. } | SendOutcome::Skipped => {}
        }
        Ok(())
    }

    async fn resolve_media(&self, refs: &[MediaRef]) -> Result<Vec<pulse_proto::MediaVariants>> {
        let mut resolved = Vec::with_capacity(refs.len());
        for media_ref in refs {
            resolved.push(self.upstreams.media.resolve(media_ref).await?);
        }
        Ok(resolved)
    }

    async fn message_retry(&self, user: UserId, message_id: &MessageId) -> Result<()> {
        match self.delivery.owner_of(message_id) {
            Some(owner) if owner == user => self.deliver(user, message_id).await,
            Some(_) => Err(Error::Authorization(format!(
                "message {message_id} belongs to another user"
            ))),
            None => Err(Error::NotFound(format!("message {message_id}"))),
        }
    }

    async fn message_sync(&self, user: UserId, entries: Vec<SyncEntry>) -> Result<()> {
        let outcome = self.delivery.sync(user, entries).await?;
        self.registry.send_to(
            user,
            ServerEvent::SyncReport {
                applied: outcome.applied,
                conflicts: outcome.conflicts,
                unchanged: outcome.unchanged,
            },
        );
        Ok(())
    }

    fn message_typing(&self, user: UserId, room_id: &RoomId) -> Result<()> {
        self.limiter.check(user, Action::Typing)?;
        self.rooms.authorize(room_id, user)?;
        if self.registry.note_typing(user, room_id) {
            self.broadcast_room(
                room_id,
                ServerEvent::Typing {
                    room_id: room_id.clone(),
                    user,
                },
                Some(user),
            );
        }
        Ok(())
    }

    async fn message_read(
        &self,
        reader: UserId,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> Result<()> {
        self.rooms.authorize(room_id, reader)?;
        let owner = self
            .delivery
            .owner_of(message_id)
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))?;
        if owner == reader {
            return Err(Error::InvalidInput("cannot read your own message".into()));
        }
        self.delivery.mark(owner, message_id, MessageStatus::Read).await?;
        self.broadcast_room(
            room_id,
            ServerEvent::ReadReceipt {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
                reader,
            },
            Some(reader),
        );
        Ok(())
    }

    async fn message_delete(
        &self,
        user: UserId,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> Result<()> {
        self.rooms.authorize(room_id, user)?;
        match self.delivery.owner_of(message_id) {
            Some(owner) if owner == user => {}
            Some(_) => {
                return Err(Error::Authorization(
                    "only the sender may delete a message".into(),
                ))
            }
            None => return Err(Error::NotFound(format!("message {message_id}"))),
        }

        self.expiry.cancel(message_id);
        let removed = self.delivery.remove(user, message_id).await?;
        if let Some(server_id) = removed.and_then(|m| m.server_id) {
            self.upstreams.persistence.delete_message(&server_id).await?;
        }
        self.broadcast_room(
            room_id,
            ServerEvent::MessageDeleted {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
            },
            None,
        );
        Ok(())
    }

    async fn handle_expired(&self, record: EphemeralRecord) {
        let removed = match self.delivery.remove(record.sender, &record.message_id).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(message_id = %record.message_id, error = %err, "Expiry queue removal failed");
                None
            }
        };
        if let Some(server_id) = removed.and_then(|m| m.server_id) {
            if let Err(err) = self.upstreams.persistence.delete_message(&server_id).await {
                warn!(message_id = %record.message_id, error = %err, "Expiry persistence delete failed");
            }
        }
        self.broadcast_room(
            &record.room_id,
            ServerEvent::MessageExpired {
                room_id: record.room_id.clone(),
                message_id: record.message_id.clone(),
            },
            None,
        );
    }

    // ---- calls ----

    async fn call_start(
        &self,
        caller: UserId,
        room_id: &RoomId,
        media_type: MediaType,
        participants: Vec<UserId>,
    ) -> Result<()> {
        self.limiter.check(caller, Action::CallStart)?;
        self.rooms.authorize(room_id, caller)?;

        // Only current room members can be invited
        let members: HashSet<UserId> = self.rooms.members(room_id).into_iter().collect();
        let invited: Vec<UserId> = participants
            .into_iter()
            .filter(|p| members.contains(p))
            .collect();

        let session = self.calls.start(room_id, caller, media_type, invited)?;
        if let Err(err) = self.rooms.set_active_call(room_id, session.id.clone()) {
            self.calls.teardown(&session.id);
            return Err(err);
        }
        if session.mode == CallMode::Relay {
            if let Err(err) = self.upstreams.relay.allocate(&session.id, room_id).await {
                self.calls.teardown(&session.id);
                self.rooms.clear_active_call(room_id, &session.id);
                return Err(err);
            }
        }

        let event = ServerEvent::IncomingCall {
            call_id: session.id.clone(),
            room_id: room_id.clone(),
            caller,
            media_type,
            mode: session.mode,
        };
        for invitee in &session.invited {
            self.registry.send_to(*invitee, event.clone());
        }
        Ok(())
    }

    fn call_accept(&self, user: UserId, call_id: &CallId) -> Result<()> {
        let session = self.calls.accept(call_id, user)?;
        let event = ServerEvent::CallAccepted {
            call_id: call_id.clone(),
            user,
        };
        for member in session.joined.iter().chain(session.invited.iter()) {
            if *member != user {
                self.registry.send_to(*member, event.clone());
            }
        }
        Ok(())
    }

    async fn call_reject(&self, user: UserId, call_id: &CallId, reason: RejectReason) -> Result<()> {
        let outcome = self.calls.reject(call_id, user, reason)?;
        let event = ServerEvent::CallRejected {
            call_id: call_id.clone(),
            user,
            reason,
            retryable: reason.retryable(),
        };
        for member in outcome.session.joined.iter() {
            self.registry.send_to(*member, event.clone());
        }
        if outcome.session_ended {
            self.rooms.clear_active_call(&outcome.session.room_id, call_id);
            if outcome.session.mode == CallMode::Relay {
                if let Err(err) = self.upstreams.relay.teardown(call_id).await {
                    warn!(call_id = %call_id, error = %err, "Relay teardown failed");
                }
            }
            self.broadcast_room(
                &outcome.session.room_id,
                ServerEvent::CallEnded {
                    call_id: call_id.clone(),
                    room_id: outcome.session.room_id.clone(),
                },
                None,
            );
        }
        Ok(())
    }

    /// Relay a signaling payload. An unauthorized signal is dropped without
    /// a protocol-level response; anything else propagates.
    fn call_signal(
        &self,
        from: UserId,
        call_id: &CallId,
        to: UserId,
        payload: SignalPayload,
    ) -> Result<()> {
        match self.calls.authorize_signal(call_id, from, to) {
            Ok(_) => {
                self.registry.send_to(
                    to,
                    ServerEvent::Signal {
                        call_id: call_id.clone(),
                        from,
                        payload,
                    },
                );
                Ok(())
            }
            Err(Error::Authorization(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn call_connection_state(
        &self,
        user: UserId,
        call_id: &CallId,
        state: PeerConnectionState,
    ) -> Result<()> {
        let (session, effect) = self.calls.connection_state(call_id, user, state)?;
        match effect {
            StateEffect::IceRestart { counterparts } => {
                self.registry.send_to(
                    user,
                    ServerEvent::IceRestart {
                        call_id: call_id.clone(),
                    },
                );
                for peer in counterparts {
                    self.registry.send_to(
                        peer,
                        ServerEvent::PeerRestartNeeded {
                            call_id: call_id.clone(),
                            peer: user,
                        },
                    );
                }
            }
            StateEffect::Unstable => {
                for member in session.counterparts(user) {
                    self.registry.send_to(
                        member,
                        ServerEvent::CallUnstable {
                            call_id: call_id.clone(),
                            user,
                            state,
                        },
                    );
                }
            }
            StateEffect::Stable { promoted } => {
                for member in session.counterparts(user) {
                    self.registry.send_to(
                        member,
                        ServerEvent::CallStable {
                            call_id: call_id.clone(),
                            user,
                        },
                    );
                }
                if promoted {
                    let event = ServerEvent::CallStateChanged {
                        call_id: call_id.clone(),
                        state: CallState::Connected,
                    };
                    for member in &session.joined {
                        self.registry.send_to(*member, event.clone());
                    }
                }
            }
            StateEffect::None => {}
        }
        Ok(())
    }

    fn call_quality(&self, user: UserId, call_id: &CallId, stats: QualityStats) -> Result<()> {
        let (tier, changed) = self.calls.quality_report(call_id, user, stats)?;
        self.registry.send_to(
            user,
            ServerEvent::MediaConstraintsUpdate {
                call_id: call_id.clone(),
                tier,
                constraints: MediaConstraints::for_tier(tier),
            },
        );
        if changed {
            if let Some(session) = self.calls.session(call_id) {
                for member in session.counterparts(user) {
                    self.registry.send_to(
                        member,
                        ServerEvent::QualityChanged {
                            call_id: call_id.clone(),
                            user,
                            tier,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Relay slot release plus end-of-call bookkeeping after a participant
    /// departure
    async fn finish_call_departure(&self, user: UserId, outcome: DepartureOutcome) {
        let session = &outcome.session;
        if session.mode == CallMode::Relay {
            if let Err(err) = self.upstreams.relay.release(&session.id, user).await {
                warn!(call_id = %session.id, user = %user, error = %err, "Relay slot release failed");
            }
        }
        if outcome.session_ended {
            self.rooms.clear_active_call(&session.room_id, &session.id);
            if session.mode == CallMode::Relay {
                if let Err(err) = self.upstreams.relay.teardown(&session.id).await {
                    warn!(call_id = %session.id, error = %err, "Relay teardown failed");
                }
            }
            self.broadcast_room(
                &session.room_id,
                ServerEvent::CallEnded {
                    call_id: session.id.clone(),
                    room_id: session.room_id.clone(),
                },
                None,
            );
        } else {
            for member in session.counterparts(user) {
                self.registry.send_to(
                    member,
                    ServerEvent::CallUnstable {
                        call_id: session.id.clone(),
                        user,
                        state: PeerConnectionState::Disconnected,
                    },
                );
            }
        }
    }

    /// Destroy a call whose room disappeared underneath it
    async fn teardown_call(&self, call_id: &CallId) {
        let Some(session) = self.calls.teardown(call_id) else {
            return;
        };
        if session.mode == CallMode::Relay {
            if let Err(err) = self.upstreams.relay.teardown(call_id).await {
                warn!(call_id = %call_id, error = %err, "Relay teardown failed");
            }
        }
        let event = ServerEvent::CallEnded {
            call_id: session.id.clone(),
            room_id: session.room_id.clone(),
        };
        for member in session.joined.iter().chain(session.invited.iter()) {
            self.registry.send_to(*member, event.clone());
        }
    }

    fn broadcast_room(&self, room_id: &RoomId, event: ServerEvent, except: Option<UserId>) {
        for member in self.rooms.members(room_id) {
            if Some(member) == except {
                continue;
            }
            self.registry.send_to(member, event.clone());
        }
    }
}
