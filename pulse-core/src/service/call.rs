//! Call session lifecycle, signaling authorization, and quality tiers.
//!
//! The coordinator owns session state only; SDP and ICE payloads pass
//! through opaque, and media flows either directly between peers or through
//! the external relay. Routing mode is decided once at call start from the
//! expected participant count and never changes mid-call.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{CallConfig, QualityThreshold};
use crate::metrics;
use crate::{Error, Result};
use pulse_proto::{
    CallId, CallMode, CallState, MediaType, PeerConnectionState, QualityStats, QualityTier,
    RejectReason, RoomId, UserId,
};

/// One live call session
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: CallId,
    pub room_id: RoomId,
    pub caller: UserId,
    pub media_type: MediaType,
    pub mode: CallMode,
    pub state: CallState,
    /// Invited but not yet accepted
    pub invited: HashSet<UserId>,
    /// Caller plus everyone who accepted
    pub joined: HashSet<UserId>,
    /// Latest classified tier per participant
    pub quality: HashMap<UserId, QualityTier>,
    /// Participants currently reporting an unstable transport
    pub unstable: HashSet<UserId>,
    pub active_speaker: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Invited or joined; signaling is authorized against this set
    #[must_use]
    pub fn is_member(&self, user: UserId) -> bool {
        self.joined.contains(&user) || self.invited.contains(&user)
    }

    /// Everyone except `user` who has accepted (or started) the call
    #[must_use]
    pub fn counterparts(&self, user: UserId) -> Vec<UserId> {
        self.joined.iter().copied().filter(|u| *u != user).collect()
    }
}

/// What a rejection did to the session
#[derive(Debug, Clone)]
pub struct RejectOutcome {
    pub session: CallSession,
    /// Everyone rejected and nobody but the caller was left
    pub session_ended: bool,
}

/// Transport-state side effects for the dispatcher to act on
#[derive(Debug, Clone)]
pub enum StateEffect {
    /// `failed`: the reporter should try an ICE restart; counterparts
    /// should expect re-negotiation
    IceRestart { counterparts: Vec<UserId> },
    /// `disconnected` / `reconnecting`: surface instability to the others
    Unstable,
    /// `connected`: instability cleared; `promoted` when this was the
    /// report that moved the session to `connected`
    Stable { promoted: bool },
    None,
}

/// What removing a participant did to their session
#[derive(Debug, Clone)]
pub struct DepartureOutcome {
    pub session: CallSession,
    /// The departing user was the last participant; the session is gone
    pub session_ended: bool,
}

/// Registry of live call sessions
pub struct CallCoordinator {
    sessions: DashMap<CallId, CallSession>,
    /// Room -> live call index; at most one per room
    by_room: DashMap<RoomId, CallId>,
    config: CallConfig,
}

impl CallCoordinator {
    #[must_use]
    pub fn new(config: CallConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            by_room: DashMap::new(),
            config,
        }
    }

    /// Create a call session in a room.
    ///
    /// Routing mode is fixed here: expected participants below the relay
    /// threshold go peer-to-peer, at or above it media routes through the
    /// relay.
    pub fn start(
        &self,
        room_id: &RoomId,
        caller: UserId,
        media_type: MediaType,
        invited: Vec<UserId>,
    ) -> Result<CallSession> {
        if let Some(existing) = self.by_room.get(room_id) {
            return Err(Error::AlreadyExists(format!(
                "room {room_id} already has call {}",
                existing.value()
            )));
        }

        let invited: HashSet<UserId> = invited.into_iter().filter(|u| *u != caller).collect();
        if invited.is_empty() {
            return Err(Error::InvalidInput("call needs at least one invitee".into()));
        }

        let expected = invited.len() + 1;
        let mode = if expected < self.config.relay_threshold {
            CallMode::PeerToPeer
        } else {
            CallMode::Relay
        };

        let session = CallSession {
            id: CallId::new(),
            room_id: room_id.clone(),
            caller,
            media_type,
            mode,
            state: CallState::Ringing,
            invited,
            joined: HashSet::from([caller]),
            quality: HashMap::new(),
            unstable: HashSet::new(),
            active_speaker: None,
            created_at: Utc::now(),
        };

        self.by_room.insert(room_id.clone(), session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());
        metrics::ACTIVE_CALLS.inc();
        info!(
            call_id = %session.id,
            room_id = %room_id,
            caller = %caller,
            mode = ?mode,
            expected,
            "Call started"
        );
        Ok(session)
    }

    /// An invitee accepts. The first accept moves the session out of
    /// `ringing`.
    pub fn accept(&self, call_id: &CallId, user: UserId) -> Result<CallSession> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        if !session.invited.remove(&user) {
            return Err(Error::Authorization(format!(
                "{user} was not invited to call {call_id}"
            )));
        }
        session.joined.insert(user);
        if session.state == CallState::Ringing {
            session.state = CallState::Accepted;
        }
        info!(call_id = %call_id, user = %user, "Call accepted");
        Ok(session.clone())
    }

    /// An invitee rejects. When every invitee has rejected and only the
    /// caller remains, the session ends.
    pub fn reject(&self, call_id: &CallId, user: UserId, reason: RejectReason) -> Result<RejectOutcome> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        if !session.invited.remove(&user) {
            return Err(Error::Authorization(format!(
                "{user} was not invited to call {call_id}"
            )));
        }
        let ended = session.invited.is_empty() && session.joined.len() <= 1;
        if ended {
            session.state = CallState::Rejected;
        }
        let snapshot = session.clone();
        drop(session);

        if ended {
            self.forget(call_id, &snapshot.room_id);
        }
        info!(call_id = %call_id, user = %user, reason = ?reason, ended, "Call rejected");
        Ok(RejectOutcome {
            session: snapshot,
            session_ended: ended,
        })
    }

    /// Authorize a signaling relay: both ends must belong to the session.
    /// A failed check is logged and counted but carries no session change.
    pub fn authorize_signal(&self, call_id: &CallId, from: UserId, to: UserId) -> Result<CallSession> {
        let session = self
            .sessions
            .get(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        if !session.is_member(from) || !session.is_member(to) {
            metrics::SIGNALS_DROPPED.inc();
            warn!(
                call_id = %call_id,
                from = %from,
                to = %to,
                "Unauthorized signaling payload dropped"
            );
            return Err(Error::Authorization(format!(
                "signal between non-participants of call {call_id}"
            )));
        }
        Ok(session.clone())
    }

    /// Apply a participant's reported transport state and derive the
    /// side effects the dispatcher should broadcast.
    pub fn connection_state(
        &self,
        call_id: &CallId,
        user: UserId,
        state: PeerConnectionState,
    ) -> Result<(CallSession, StateEffect)> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        if !session.joined.contains(&user) {
            return Err(Error::Authorization(format!(
                "{user} is not a participant of call {call_id}"
            )));
        }

        let effect = match state {
            PeerConnectionState::Failed => {
                session.unstable.insert(user);
                StateEffect::IceRestart {
                    counterparts: session.counterparts(user),
                }
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Reconnecting => {
                session.unstable.insert(user);
                StateEffect::Unstable
            }
            PeerConnectionState::Connected => {
                session.unstable.remove(&user);
                let promoted = session.state == CallState::Accepted;
                if promoted {
                    session.state = CallState::Connected;
                }
                StateEffect::Stable { promoted }
            }
            PeerConnectionState::Checking => StateEffect::None,
        };
        debug!(call_id = %call_id, user = %user, state = ?state, "Connection state applied");
        Ok((session.clone(), effect))
    }

    /// Classify reported stats into a quality tier and record it.
    /// Returns the tier and whether it differs from the previous one.
    pub fn quality_report(
        &self,
        call_id: &CallId,
        user: UserId,
        stats: QualityStats,
    ) -> Result<(QualityTier, bool)> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        if !session.joined.contains(&user) {
            return Err(Error::Authorization(format!(
                "{user} is not a participant of call {call_id}"
            )));
        }
        let tier = self.classify(stats);
        let previous = session.quality.insert(user, tier);
        let changed = previous != Some(tier);
        if changed {
            info!(call_id = %call_id, user = %user, tier = tier.as_str(), "Quality tier changed");
        }
        Ok((tier, changed))
    }

    /// Map loss/RTT stats onto a tier. Either metric crossing a boundary
    /// drags the tier down, even when the other was not measured; a report
    /// with no measurements at all sits in the middle.
    #[must_use]
    pub fn classify(&self, stats: QualityStats) -> QualityTier {
        if stats.packet_loss_pct.is_none() && stats.rtt_ms.is_none() {
            return QualityTier::Medium;
        }
        let worse_than = |bound: &QualityThreshold| {
            stats
                .packet_loss_pct
                .is_some_and(|loss| loss > bound.packet_loss_pct)
                || stats.rtt_ms.is_some_and(|rtt| rtt > bound.rtt_ms)
        };
        let cfg = &self.config;
        if worse_than(&cfg.audio_only_above) {
            QualityTier::AudioOnly
        } else if worse_than(&cfg.low_above) {
            QualityTier::Low
        } else if worse_than(&cfg.medium_above) {
            QualityTier::Medium
        } else {
            QualityTier::High
        }
    }

    /// Record the dominant speaker, as detected by the media relay.
    /// Returns `true` when the speaker changed.
    pub fn set_active_speaker(&self, call_id: &CallId, user: UserId) -> Result<bool> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        if !session.joined.contains(&user) {
            return Err(Error::Authorization(format!(
                "{user} is not a participant of call {call_id}"
            )));
        }
        let changed = session.active_speaker != Some(user);
        session.active_speaker = Some(user);
        Ok(changed)
    }

    /// Remove a user from one session. The session is destroyed when its
    /// last joined participant leaves. Returns `None` when the user was
    /// not part of the session.
    pub fn remove_participant(&self, call_id: &CallId, user: UserId) -> Option<DepartureOutcome> {
        let mut session = self.sessions.get_mut(call_id)?;
        if !session.is_member(user) {
            return None;
        }
        session.invited.remove(&user);
        session.joined.remove(&user);
        session.quality.remove(&user);
        session.unstable.remove(&user);
        if session.active_speaker == Some(user) {
            session.active_speaker = None;
        }
        let ended = session.joined.is_empty();
        if ended {
            session.state = CallState::Ended;
        }
        let snapshot = session.clone();
        drop(session);

        if ended {
            self.forget(call_id, &snapshot.room_id);
        }
        info!(call_id = %call_id, user = %user, ended, "Call participant removed");
        Some(DepartureOutcome {
            session: snapshot,
            session_ended: ended,
        })
    }

    /// Remove a user from every session they appear in (leave, disconnect
    /// purge, or room departure)
    pub fn remove_participant_everywhere(&self, user: UserId) -> Vec<DepartureOutcome> {
        let affected: Vec<CallId> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_member(user))
            .map(|entry| entry.key().clone())
            .collect();

        affected
            .iter()
            .filter_map(|call_id| self.remove_participant(call_id, user))
            .collect()
    }

    /// Destroy a session outright (room deleted under it, or shutdown)
    pub fn teardown(&self, call_id: &CallId) -> Option<CallSession> {
        let (_, mut session) = self.sessions.remove(call_id)?;
        session.state = CallState::Ended;
        self.by_room.remove(&session.room_id);
        metrics::ACTIVE_CALLS.dec();
        info!(call_id = %call_id, room_id = %session.room_id, "Call torn down");
        Some(session)
    }

    fn forget(&self, call_id: &CallId, room_id: &RoomId) {
        if self.sessions.remove(call_id).is_some() {
            metrics::ACTIVE_CALLS.dec();
        }
        self.by_room.remove(room_id);
    }

    #[must_use]
    pub fn session(&self, call_id: &CallId) -> Option<CallSession> {
        self.sessions.get(call_id).map(|s| s.clone())
    }

    #[must_use]
    pub fn session_in_room(&self, room_id: &RoomId) -> Option<CallSession> {
        let call_id = self.by_room.get(room_id)?.clone();
        self.session(&call_id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove and return every live session (shutdown notification)
    pub fn drain_all(&self) -> Vec<CallSession> {
        let ids: Vec<CallId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.teardown(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> CallCoordinator {
        CallCoordinator::new(CallConfig::default())
    }

    fn users(ids: &[u64]) -> Vec<UserId> {
        ids.iter().map(|id| UserId::new(*id)).collect()
    }

    #[test]
    fn test_small_call_is_peer_to_peer() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();
        assert_eq!(session.mode, CallMode::PeerToPeer);
        assert_eq!(session.state, CallState::Ringing);
        assert!(session.joined.contains(&UserId::new(1)));
    }

    #[test]
    fn test_group_call_routes_through_relay() {
        let calls = coordinator();
        // 1 caller + 5 invitees = 6 expected, over the threshold of 4
        let session = calls
            .start(
                &RoomId::from("r1"),
                UserId::new(1),
                MediaType::AudioVideo,
                users(&[2, 3, 4, 5, 6]),
            )
            .unwrap();
        assert_eq!(session.mode, CallMode::Relay);
    }

    #[test]
    fn test_one_call_per_room() {
        let calls = coordinator();
        let room = RoomId::from("r1");
        calls
            .start(&room, UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();
        let err = calls
            .start(&room, UserId::new(3), MediaType::Audio, users(&[4]))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_accept_moves_out_of_ringing() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2, 3]))
            .unwrap();

        let session = calls.accept(&session.id, UserId::new(2)).unwrap();
        assert_eq!(session.state, CallState::Accepted);
        assert!(session.joined.contains(&UserId::new(2)));

        // Uninvited user cannot accept
        let err = calls.accept(&session.id, UserId::new(9)).unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[test]
    fn test_all_rejections_end_the_call() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2, 3]))
            .unwrap();

        let outcome = calls.reject(&session.id, UserId::new(2), RejectReason::Busy).unwrap();
        assert!(!outcome.session_ended);

        let outcome = calls
            .reject(&session.id, UserId::new(3), RejectReason::Declined)
            .unwrap();
        assert!(outcome.session_ended);
        assert_eq!(outcome.session.state, CallState::Rejected);
        assert!(calls.session(&session.id).is_none());
        assert!(calls.session_in_room(&RoomId::from("r1")).is_none());
    }

    #[test]
    fn test_rejection_after_an_accept_keeps_the_call() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2, 3]))
            .unwrap();
        calls.accept(&session.id, UserId::new(2)).unwrap();

        let outcome = calls
            .reject(&session.id, UserId::new(3), RejectReason::Unavailable)
            .unwrap();
        assert!(!outcome.session_ended);
        assert!(calls.session(&session.id).is_some());
    }

    #[test]
    fn test_signal_authorization() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();

        assert!(calls.authorize_signal(&session.id, UserId::new(1), UserId::new(2)).is_ok());
        // Outsider on either end is rejected
        assert!(calls.authorize_signal(&session.id, UserId::new(9), UserId::new(2)).is_err());
        assert!(calls.authorize_signal(&session.id, UserId::new(1), UserId::new(9)).is_err());
    }

    #[test]
    fn test_failed_transport_triggers_ice_restart() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();
        calls.accept(&session.id, UserId::new(2)).unwrap();

        let (session, effect) = calls
            .connection_state(&session.id, UserId::new(2), PeerConnectionState::Failed)
            .unwrap();
        match effect {
            StateEffect::IceRestart { counterparts } => {
                assert_eq!(counterparts, vec![UserId::new(1)]);
            }
            other => panic!("expected IceRestart, got {other:?}"),
        }
        assert!(session.unstable.contains(&UserId::new(2)));
    }

    #[test]
    fn test_connected_report_promotes_and_clears_instability() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();
        calls.accept(&session.id, UserId::new(2)).unwrap();
        calls
            .connection_state(&session.id, UserId::new(2), PeerConnectionState::Disconnected)
            .unwrap();

        let (session, effect) = calls
            .connection_state(&session.id, UserId::new(2), PeerConnectionState::Connected)
            .unwrap();
        assert!(matches!(effect, StateEffect::Stable { promoted: true }));
        assert_eq!(session.state, CallState::Connected);
        assert!(session.unstable.is_empty());

        // A second connected report does not re-promote
        let (_, effect) = calls
            .connection_state(&session.id, UserId::new(1), PeerConnectionState::Connected)
            .unwrap();
        assert!(matches!(effect, StateEffect::Stable { promoted: false }));
    }

    #[test]
    fn test_quality_classification_boundaries() {
        let calls = coordinator();
        let tier = |loss: f32, rtt: u32| {
            calls.classify(QualityStats {
                packet_loss_pct: Some(loss),
                rtt_ms: Some(rtt),
            })
        };

        assert_eq!(tier(0.5, 50), QualityTier::High);
        assert_eq!(tier(3.0, 50), QualityTier::Medium);
        assert_eq!(tier(0.5, 150), QualityTier::Medium);
        assert_eq!(tier(6.0, 50), QualityTier::Low);
        assert_eq!(tier(0.5, 250), QualityTier::Low);
        assert_eq!(tier(11.0, 50), QualityTier::AudioOnly);
        assert_eq!(tier(0.5, 350), QualityTier::AudioOnly);
        // Unmeasured stats land in the middle
        assert_eq!(calls.classify(QualityStats::default()), QualityTier::Medium);
    }

    #[test]
    fn test_single_metric_still_drags_tier_down() {
        let calls = coordinator();

        // Loss reported without RTT
        let tier = calls.classify(QualityStats {
            packet_loss_pct: Some(12.0),
            rtt_ms: None,
        });
        assert_eq!(tier, QualityTier::AudioOnly);

        // RTT reported without loss
        let tier = calls.classify(QualityStats {
            packet_loss_pct: None,
            rtt_ms: Some(250),
        });
        assert_eq!(tier, QualityTier::Low);

        // A clean single metric still classifies as high
        let tier = calls.classify(QualityStats {
            packet_loss_pct: Some(0.5),
            rtt_ms: None,
        });
        assert_eq!(tier, QualityTier::High);
    }

    #[test]
    fn test_quality_report_tracks_changes() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Video, users(&[2]))
            .unwrap();

        let stats = QualityStats {
            packet_loss_pct: Some(6.0),
            rtt_ms: Some(100),
        };
        let (tier, changed) = calls.quality_report(&session.id, UserId::new(1), stats).unwrap();
        assert_eq!(tier, QualityTier::Low);
        assert!(changed);
        let (_, changed) = calls.quality_report(&session.id, UserId::new(1), stats).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_last_departure_destroys_session() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();
        calls.accept(&session.id, UserId::new(2)).unwrap();

        let outcomes = calls.remove_participant_everywhere(UserId::new(2));
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].session_ended);

        let outcomes = calls.remove_participant_everywhere(UserId::new(1));
        assert!(outcomes[0].session_ended);
        assert_eq!(outcomes[0].session.state, CallState::Ended);
        assert_eq!(calls.session_count(), 0);
    }

    #[test]
    fn test_active_speaker_change_detection() {
        let calls = coordinator();
        let session = calls
            .start(&RoomId::from("r1"), UserId::new(1), MediaType::Audio, users(&[2]))
            .unwrap();
        calls.accept(&session.id, UserId::new(2)).unwrap();

        assert!(calls.set_active_speaker(&session.id, UserId::new(1)).unwrap());
        assert!(!calls.set_active_speaker(&session.id, UserId::new(1)).unwrap());
        assert!(calls.set_active_speaker(&session.id, UserId::new(2)).unwrap());
    }
}
