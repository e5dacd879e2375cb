//! Room directory: who is in which conversation right now.
//!
//! Dual index (room -> members, user -> rooms) kept consistent under the
//! per-entry locks; every mutation touches both sides before returning.
//! Rooms are created implicitly on first join and deleted when the last
//! member leaves.

use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::metrics;
use crate::{Error, Result};
use pulse_proto::{CallId, RoomId, RoomKind, UserId};

/// Live state of one room
#[derive(Debug, Clone)]
pub struct RoomEntry {
    pub kind: RoomKind,
    pub members: HashSet<UserId>,
    /// At most one live call per room
    pub active_call: Option<CallId>,
}

/// Outcome of a join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The room did not exist before this join
    pub created: bool,
    /// The user was not already a member
    pub joined: bool,
}

/// Outcome of a leave
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    /// The leaver was the last member and the room entry is gone
    pub room_deleted: bool,
    /// Call that must be torn down before the room is forgotten
    pub orphaned_call: Option<CallId>,
    /// Members that remain (for presence broadcasts)
    pub remaining: Vec<UserId>,
}

/// In-memory room membership directory
#[derive(Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomId, RoomEntry>,
    user_rooms: DashMap<UserId, HashSet<RoomId>>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to `room`, creating the room with `kind` if it is new.
    /// Joining a room you are already in is a no-op.
    pub fn join(&self, room_id: &RoomId, user: UserId, kind: RoomKind) -> JoinOutcome {
        let mut created = false;
        let mut entry = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            created = true;
            RoomEntry {
                kind,
                members: HashSet::new(),
                active_call: None,
            }
        });
        let joined = entry.members.insert(user);
        drop(entry);

        if joined {
            self.user_rooms.entry(user).or_default().insert(room_id.clone());
        }
        if created {
            metrics::ACTIVE_ROOMS.inc();
            info!(room_id = %room_id, kind = ?kind, "Room created");
        }
        debug!(room_id = %room_id, user = %user, joined, "Room join");
        JoinOutcome { created, joined }
    }

    /// Remove `user` from `room`. Deletes the room when the last member
    /// leaves and reports the call that must be torn down first, if any.
    pub fn leave(&self, room_id: &RoomId, user: UserId) -> Result<LeaveOutcome> {
        let mut entry = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
        if !entry.members.remove(&user) {
            return Err(Error::NotFound(format!("{user} is not in room {room_id}")));
        }
        let remaining: Vec<UserId> = entry.members.iter().copied().collect();
        let empty = entry.members.is_empty();
        let orphaned_call = if empty { entry.active_call.take() } else { None };
        drop(entry);

        if let Some(mut rooms) = self.user_rooms.get_mut(&user) {
            rooms.remove(room_id);
        }
        if empty {
            self.rooms.remove(room_id);
            metrics::ACTIVE_ROOMS.dec();
            info!(room_id = %room_id, "Room deleted (last member left)");
        }
        Ok(LeaveOutcome {
            room_deleted: empty,
            orphaned_call,
            remaining,
        })
    }

    /// Remove `user` from every room they are in (presence purge).
    /// Returns one outcome per room, in no particular order.
    pub fn remove_user_everywhere(&self, user: UserId) -> Vec<(RoomId, LeaveOutcome)> {
        let rooms: Vec<RoomId> = self
            .user_rooms
            .remove(&user)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();

        let mut outcomes = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            if let Ok(outcome) = self.leave(&room_id, user) {
                outcomes.push((room_id, outcome));
            }
        }
        outcomes
    }

    /// Error unless `user` is currently a member of `room`
    pub fn authorize(&self, room_id: &RoomId, user: UserId) -> Result<()> {
        let member = self
            .rooms
            .get(room_id)
            .is_some_and(|entry| entry.members.contains(&user));
        if member {
            Ok(())
        } else {
            Err(Error::Authorization(format!(
                "{user} is not a member of room {room_id}"
            )))
        }
    }

    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> Vec<UserId> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.members.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn rooms_of(&self, user: UserId) -> Vec<RoomId> {
        self.user_rooms
            .get(&user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn kind_of(&self, room_id: &RoomId) -> Option<RoomKind> {
        self.rooms.get(room_id).map(|entry| entry.kind)
    }

    /// Record `call_id` as the room's live call. At most one per room.
    pub fn set_active_call(&self, room_id: &RoomId, call_id: CallId) -> Result<()> {
        let mut entry = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
        if let Some(existing) = &entry.active_call {
            return Err(Error::AlreadyExists(format!(
                "room {room_id} already has call {existing}"
            )));
        }
        entry.active_call = Some(call_id);
        Ok(())
    }

    /// Clear the room's live call if it matches `call_id`
    pub fn clear_active_call(&self, room_id: &RoomId, call_id: &CallId) {
        if let Some(mut entry) = self.rooms.get_mut(room_id) {
            if entry.active_call.as_ref() == Some(call_id) {
                entry.active_call = None;
            }
        }
    }

    #[must_use]
    pub fn active_call(&self, room_id: &RoomId) -> Option<CallId> {
        self.rooms.get(room_id).and_then(|entry| entry.active_call.clone())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
