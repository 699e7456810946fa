//! # skiff-client
//!
//! The peer-side core of a Skiff room: envelope sealing per security mode,
//! epoch key agreement for forward-secure rooms, and piece-based file
//! transfer with chunked metadata distribution. Everything runs inside one
//! session task, see [`spawn_session`].

pub mod context;
pub mod epoch;
pub mod error;
pub mod events;
pub mod history;
pub mod metadata;
pub mod secure_channel;
pub mod session;
pub mod timers;
pub mod transfer;

pub use epoch::{EpochKey, EpochKeyManager, EpochState};
pub use error::{ClientError, Result};
pub use events::{Artifact, ClientEvent};
pub use history::ChatHistory;
pub use metadata::{MetadataCollector, MetadataDistribution};
pub use secure_channel::{RoomContext, SecureChannel, SecurityMode};
pub use session::{spawn_session, SessionCommand, SessionHandle, SessionStatus};
pub use transfer::{DownloadStatus, PieceStatus, TransferEngine};
