//! Room discovery.
//!
//! Presence packets travel on a channel every peer subscribes to, whatever
//! room it is in. Recording them per room gives a directory of the rooms
//! currently in use and how many peers each one has.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use skiff_shared::types::{PeerId, RoomId};

/// A room seen on the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    /// Peers heard from within the prune window.
    pub members: usize,
    /// The room uses a password or forward-secure mode.
    pub protected: bool,
    /// Unix millis of the latest presence in the room.
    pub last_seen: u64,
}

#[derive(Debug, Clone)]
struct RoomActivity {
    members: HashMap<PeerId, u64>,
    protected: bool,
    last_seen: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, RoomActivity>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence from `peer` in `room_id` at `now` (Unix millis).
    ///
    /// Returns `true` the first time a room is seen.
    pub fn observe(&mut self, room_id: &RoomId, peer: &PeerId, protected: bool, now: u64) -> bool {
        let mut discovered = false;
        let room = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            debug!(room = %room_id, protected, "Discovered room");
            discovered = true;
            RoomActivity {
                members: HashMap::new(),
                protected,
                last_seen: now,
            }
        });

        let last = room.members.entry(peer.clone()).or_insert(now);
        *last = (*last).max(now);
        room.last_seen = room.last_seen.max(now);
        room.protected = protected;
        discovered
    }

    /// Drop members silent for longer than `timeout_ms`, then rooms left
    /// without members.
    ///
    /// Returns the rooms that disappeared.
    pub fn prune(&mut self, now: u64, timeout_ms: u64) -> Vec<RoomId> {
        for room in self.rooms.values_mut() {
            room.members
                .retain(|_, last| now.saturating_sub(*last) <= timeout_ms);
        }

        let empty: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.members.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &empty {
            self.rooms.remove(id);
            debug!(room = %id, "Room went quiet");
        }
        empty
    }

    /// Forget `peer` in `room_id`, dropping the room if it empties.
    pub fn leave(&mut self, room_id: &RoomId, peer: &PeerId) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.remove(peer);
            if room.members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    pub fn get(&self, room_id: &RoomId) -> Option<RoomSummary> {
        self.rooms.get(room_id).map(|room| summarize(room_id, room))
    }

    /// Every known room, busiest first, then by name.
    pub fn summaries(&self) -> Vec<RoomSummary> {
        let mut out: Vec<RoomSummary> = self
            .rooms
            .iter()
            .map(|(id, room)| summarize(id, room))
            .collect();
        out.sort_by(|a, b| {
            b.members
                .cmp(&a.members)
                .then_with(|| a.room_id.as_str().cmp(b.room_id.as_str()))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

fn summarize(room_id: &RoomId, room: &RoomActivity) -> RoomSummary {
    RoomSummary {
        room_id: room_id.clone(),
        members: room.members.len(),
        protected: room.protected,
        last_seen: room.last_seen,
    }
}
