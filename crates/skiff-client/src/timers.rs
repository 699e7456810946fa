//! One-shot protocol timers.
//!
//! Each timer is a spawned sleep that posts a [`TimerEvent`] back into the
//! session loop. Scheduling a timer that already exists replaces it, and
//! every event carries a sequence token so an event that raced with a cancel
//! or a reschedule is recognised as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use skiff_shared::types::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    PieceTimeout { file_id: FileId, piece_index: u32 },
    /// Re-run source discovery or dispatch for a stalled download.
    DownloadRetry { file_id: FileId },
    MetadataTimeout { file_id: FileId },
}

impl TimerKind {
    pub fn file_id(&self) -> FileId {
        match self {
            TimerKind::PieceTimeout { file_id, .. }
            | TimerKind::DownloadRetry { file_id }
            | TimerKind::MetadataTimeout { file_id } => *file_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub kind: TimerKind,
    seq: u64,
}

pub struct Timers {
    tx: mpsc::UnboundedSender<TimerEvent>,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_seq: u64,
}

impl Timers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                armed: HashMap::new(),
                next_seq: 0,
            },
            rx,
        )
    }

    /// Arm `kind` to fire after `delay`, replacing any armed instance.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(&kind);

        self.next_seq += 1;
        let seq = self.next_seq;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerEvent { kind, seq });
        });
        self.armed.insert(kind, (seq, handle));
    }

    pub fn cancel(&mut self, kind: &TimerKind) -> bool {
        match self.armed.remove(kind) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer belonging to `file_id`.
    pub fn cancel_file(&mut self, file_id: &FileId) {
        self.armed.retain(|kind, (_, handle)| {
            if kind.file_id() == *file_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Claim a fired event. Returns `false` for stale events.
    pub fn fire(&mut self, event: &TimerEvent) -> bool {
        match self.armed.get(&event.kind) {
            Some((seq, _)) if *seq == event.seq => {
                self.armed.remove(&event.kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: &TimerKind) -> bool {
        self.armed.contains_key(kind)
    }

    pub fn armed(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
