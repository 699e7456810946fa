use serde::{Deserialize, Serialize};

use crate::constants::PUBKEY_SIZE;
use crate::crypto::Sealed;
use crate::types::{EpochId, FileId, PeerId, PieceHash, RoomId, SecurityModeKind};

/// Publish/subscribe channels the client uses on the shared transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Chat messages and file announcements (sealed)
    Chat,
    /// Piece requests and piece payloads
    File,
    /// Source discovery and metadata chunks
    FileMeta,
    /// Public key announcements, epoch key distribution, rekey requests
    KeyControl,
    /// Periodic presence signals and chat history snapshots
    Presence,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Chat,
        Channel::File,
        Channel::FileMeta,
        Channel::KeyControl,
        Channel::Presence,
    ];

    pub fn to_topic(&self) -> &'static str {
        match self {
            Channel::Chat => "skiff/chat",
            Channel::File => "skiff/file",
            Channel::FileMeta => "skiff/file-meta",
            Channel::KeyControl => "skiff/key-control",
            Channel::Presence => "skiff/presence",
        }
    }
}

/// Every payload published on the transport. Packets for another room are
/// ignored by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub room_id: RoomId,
    pub message: WireMessage,
}

/// All wire protocol messages exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Liveness signal feeding the active member set and, for peers in
    /// other rooms, room discovery. `protected` is set outside open rooms.
    Presence { protected: bool },

    /// Recent chat history for late joiners, sealed per room mode
    History(Envelope),

    /// Sealed chat payload (text or file announcement)
    Chat(Envelope),

    /// Who holds this file?
    SourceRequest { file_id: FileId },

    /// I hold this file
    SourceAnnounce { file_id: FileId },

    /// Send me the piece hash list
    MetadataRequest { file_id: FileId },

    /// One index-addressed slice of a piece hash list
    MetadataPiece(MetadataChunk),

    /// Ask one seeder for one piece
    PieceRequest {
        file_id: FileId,
        piece_index: u32,
        target_seeder: PeerId,
    },

    /// Piece bytes, sealed according to the room mode
    FilePiece {
        file_id: FileId,
        piece_index: u32,
        envelope: Envelope,
    },

    /// X25519 public half of the sender's epoch keypair, plus the epoch the
    /// sender currently holds so a coordinator never issues a lower one
    PublicKeyAnnounce {
        public_key: [u8; PUBKEY_SIZE],
        held_epoch: Option<EpochId>,
    },

    /// Epoch key material wrapped for a single recipient
    EpochKeyDistribution {
        epoch_id: EpochId,
        recipient: PeerId,
        sealed: Sealed,
    },

    /// Ask the coordinator to rotate now
    RekeyRequest,
}

impl WireMessage {
    /// Channel this message travels on.
    pub fn channel(&self) -> Channel {
        match self {
            WireMessage::Presence { .. } | WireMessage::History(_) => Channel::Presence,
            WireMessage::Chat(_) => Channel::Chat,
            WireMessage::SourceRequest { .. }
            | WireMessage::SourceAnnounce { .. }
            | WireMessage::MetadataRequest { .. }
            | WireMessage::MetadataPiece(_) => Channel::FileMeta,
            WireMessage::PieceRequest { .. } | WireMessage::FilePiece { .. } => Channel::File,
            WireMessage::PublicKeyAnnounce { .. }
            | WireMessage::EpochKeyDistribution { .. }
            | WireMessage::RekeyRequest => Channel::KeyControl,
        }
    }
}

/// Sealed wire representation of a confidential payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Plaintext, tagged so receivers skip decryption
    Open(Vec<u8>),
    /// Encrypted under the room password key
    Password(Sealed),
    /// Encrypted under the epoch key identified by `epoch_id`
    ForwardSecure { epoch_id: EpochId, sealed: Sealed },
}

impl Envelope {
    pub fn mode(&self) -> SecurityModeKind {
        match self {
            Envelope::Open(_) => SecurityModeKind::Open,
            Envelope::Password(_) => SecurityModeKind::Password,
            Envelope::ForwardSecure { .. } => SecurityModeKind::ForwardSecure,
        }
    }
}

/// Plaintext inside a chat envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatPayload {
    Text(String),
    FileAnnounce(FileAnnouncement),
}

impl ChatPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// One remembered chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender: PeerId,
    pub timestamp: u64,
    pub text: String,
}

/// Plaintext inside a `History` envelope.
///
/// `counter` counts every chat line the publisher has recorded in the room;
/// receivers only take snapshots with a higher counter than their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub counter: u64,
    pub messages: Vec<HistoryEntry>,
}

impl HistorySnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Lightweight projection of [`FileMetadata`] announced in chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnnouncement {
    pub file_id: FileId,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub piece_count: u32,
}

/// Full description of a file, including the ordered piece hash list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: FileId,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub piece_hashes: Vec<PieceHash>,
}

impl FileMetadata {
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn announcement(&self) -> FileAnnouncement {
        FileAnnouncement {
            file_id: self.file_id,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_type: self.file_type.clone(),
            piece_count: self.piece_count(),
        }
    }
}

/// One chunk of a piece hash list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChunk {
    pub file_id: FileId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub hashes: Vec<PieceHash>,
}

impl Packet {
    pub fn new(room_id: RoomId, message: WireMessage) -> Self {
        Self { room_id, message }
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
