use thiserror::Error;

use skiff_net::NetError;
use skiff_shared::{CryptoError, FileId};
use skiff_store::StoreError;

/// Errors surfaced by the client core.
///
/// Nothing here is fatal to a session: every variant is scoped to one
/// action, one transfer or one piece.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Publish rejected by the transport.
    #[error("Transport failure: {0}")]
    Transport(#[from] NetError),

    /// Decryption or authentication of an envelope failed.
    #[error("Authentication failed")]
    AuthFailure,

    /// A forward-secure send was attempted before any epoch key was held.
    #[error("No epoch key held yet")]
    KeyNotReady,

    /// Piece bytes did not match the expected hash.
    #[error("Piece {piece} of {file_id} failed hash verification")]
    HashMismatch { file_id: FileId, piece: u32 },

    /// No seeder is known for the file yet.
    #[error("No seeders known for {0}")]
    NoSeeders(FileId),

    #[error("Unknown file {0}")]
    UnknownFile(FileId),

    /// The session task has stopped.
    #[error("Session is no longer in a room")]
    NotInRoom,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A blocking worker panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
