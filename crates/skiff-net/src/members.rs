//! Active member tracking.
//!
//! Maintains an in-memory map of room members and the last time each one was
//! heard from. The member set drives coordinator election: the coordinator is
//! always the lexicographically smallest id currently present.

use std::collections::HashMap;

use tracing::debug;

use skiff_shared::types::PeerId;

/// Tracks which peers are currently active in the room.
#[derive(Debug, Clone, Default)]
pub struct ActiveMembers {
    members: HashMap<PeerId, u64>,
}

impl ActiveMembers {
    /// Create a new, empty member set.
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
        }
    }

    /// Record activity from `peer_id` at `now` (Unix epoch millis).
    ///
    /// Returns `true` if the peer was not previously a member.
    pub fn touch(&mut self, peer_id: &PeerId, now: u64) -> bool {
        match self.members.get_mut(peer_id) {
            Some(last) => {
                *last = (*last).max(now);
                false
            }
            None => {
                debug!(peer = %peer_id, "Member joined");
                self.members.insert(peer_id.clone(), now);
                true
            }
        }
    }

    /// Remove a peer explicitly.
    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        self.members.remove(peer_id).is_some()
    }

    /// Drop every member silent for longer than `timeout_ms`, except `keep`.
    ///
    /// Returns the pruned ids.
    pub fn prune(&mut self, now: u64, timeout_ms: u64, keep: &PeerId) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .members
            .iter()
            .filter(|(id, last)| *id != keep && now.saturating_sub(**last) > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.members.remove(id);
            debug!(peer = %id, "Member timed out");
        }
        stale
    }

    /// The elected coordinator: the smallest id in the set.
    ///
    /// Computed from the live set on every call, never cached.
    pub fn coordinator(&self) -> Option<&PeerId> {
        self.members.keys().min()
    }

    /// Check whether a peer is currently a member.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.members.contains_key(peer_id)
    }

    /// Timestamp of the last activity seen from `peer_id`.
    pub fn last_active(&self, peer_id: &PeerId) -> Option<u64> {
        self.members.get(peer_id).copied()
    }

    /// All member ids, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|n| PeerId::new(*n)).collect()
    }

    #[test]
    fn test_coordinator_independent_of_insertion_order() {
        let names = ["mango", "apple", "zebra", "apricot", "kiwi"];
        let orders: [[usize; 5]; 3] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3]];

        for order in orders {
            let mut members = ActiveMembers::new();
            for i in order {
                members.touch(&PeerId::new(names[i]), 1_000);
            }
            assert_eq!(members.coordinator(), Some(&PeerId::new("apple")));
        }
    }

    #[test]
    fn test_empty_set_has_no_coordinator() {
        assert!(ActiveMembers::new().coordinator().is_none());
    }

    #[test]
    fn test_coordinator_departure_heals() {
        let me = PeerId::new("m");
        let mut members = ActiveMembers::new();
        members.touch(&PeerId::new("a"), 0);
        members.touch(&me, 10_000);
        assert_eq!(members.coordinator(), Some(&PeerId::new("a")));

        let pruned = members.prune(20_000, 15_000, &me);
        assert_eq!(pruned, ids(&["a"]));
        assert_eq!(members.coordinator(), Some(&me));
    }

    #[test]
    fn test_touch_reports_new_members_only() {
        let mut members = ActiveMembers::new();
        let p = PeerId::new("p");

        assert!(members.touch(&p, 1));
        assert!(!members.touch(&p, 2));
        assert_eq!(members.last_active(&p), Some(2));

        // stale timestamps never move activity backwards
        members.touch(&p, 1);
        assert_eq!(members.last_active(&p), Some(2));
    }

    #[test]
    fn test_prune_keeps_self() {
        let me = PeerId::new("self");
        let mut members = ActiveMembers::new();
        members.touch(&me, 0);
        members.touch(&PeerId::new("other"), 0);

        let pruned = members.prune(100_000, 15_000, &me);
        assert_eq!(pruned, ids(&["other"]));
        assert!(members.contains(&me));
        assert_eq!(members.len(), 1);
    }
}
