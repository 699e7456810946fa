use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use skiff_shared::protocol::{Channel, FileAnnouncement, HistoryEntry};
use skiff_shared::types::{EpochId, FileId, PeerId, RoomId};

/// A finished download.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Assembled in memory from the piece store.
    Memory(Arc<Vec<u8>>),
    /// Streamed to disk.
    Disk(PathBuf),
}

impl Artifact {
    /// Read the full contents regardless of where they live.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Artifact::Memory(bytes) => Ok(bytes.as_ref().clone()),
            Artifact::Disk(path) => tokio::fs::read(path).await,
        }
    }
}

/// Notifications pushed from the session task to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ChatReceived {
        sender: PeerId,
        text: String,
        timestamp: u64,
    },
    /// Chat lines from before we joined, oldest first.
    HistoryReceived {
        from: PeerId,
        messages: Vec<HistoryEntry>,
    },
    /// An envelope from `sender` could not be opened.
    Undecryptable { sender: PeerId, channel: Channel },
    FileAnnounced {
        sender: PeerId,
        announcement: FileAnnouncement,
    },
    SeedersUpdated { file_id: FileId, seeders: usize },
    DownloadProgress {
        file_id: FileId,
        received: u32,
        total: u32,
    },
    DownloadComplete {
        file_id: FileId,
        file_name: String,
        artifact: Artifact,
    },
    DownloadFailed { file_id: FileId, reason: String },
    /// `from` is the local peer when the key was generated here.
    EpochKeyAdopted { epoch_id: EpochId, from: PeerId },
    MembersChanged { members: Vec<PeerId> },
    /// Presence was first seen from another room.
    RoomDiscovered { room_id: RoomId, protected: bool },
}

pub fn emit_event(tx: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    if let Err(e) = tx.send(event) {
        tracing::debug!(event = ?e.0, "Event receiver dropped");
    }
}
