//! Bounded chat history for late joiners.
//!
//! Open and password rooms keep the most recent chat lines and publish them
//! as a sealed [`HistorySnapshot`] so a peer entering the room can catch up.
//! Forward-secure rooms never keep history: a joiner must not read what was
//! said before it held a key.

use std::collections::VecDeque;

use tracing::debug;

use skiff_shared::protocol::{HistoryEntry, HistorySnapshot};

#[derive(Debug)]
pub struct ChatHistory {
    limit: usize,
    counter: u64,
    entries: VecDeque<HistoryEntry>,
    /// Changed since the last snapshot was taken.
    dirty: bool,
}

impl ChatHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            counter: 0,
            entries: VecDeque::new(),
            dirty: false,
        }
    }

    /// Remember a chat line seen live in the room.
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        self.counter += 1;
        self.dirty = true;
    }

    /// Take a snapshot for publishing, clearing the dirty flag.
    ///
    /// `None` when there is nothing to share.
    pub fn snapshot(&mut self) -> Option<HistorySnapshot> {
        if self.entries.is_empty() {
            return None;
        }
        self.dirty = false;
        Some(HistorySnapshot {
            counter: self.counter,
            messages: self.entries.iter().cloned().collect(),
        })
    }

    /// Adopt a snapshot that is ahead of ours.
    ///
    /// Returns the lines we had not seen, oldest first. A snapshot whose
    /// counter does not exceed ours is ignored.
    pub fn merge(&mut self, snapshot: HistorySnapshot) -> Vec<HistoryEntry> {
        if self.limit == 0 || snapshot.counter <= self.counter {
            return Vec::new();
        }

        let unseen: Vec<HistoryEntry> = snapshot
            .messages
            .iter()
            .filter(|m| !self.entries.contains(m))
            .cloned()
            .collect();
        debug!(
            counter = snapshot.counter,
            lines = snapshot.messages.len(),
            unseen = unseen.len(),
            "Adopted chat history"
        );

        let skip = snapshot.messages.len().saturating_sub(self.limit);
        self.entries = snapshot.messages.into_iter().skip(skip).collect();
        self.counter = snapshot.counter;
        unseen
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.counter = 0;
        self.dirty = false;
    }
}
