//! # skiff-shared
//!
//! Types, wire protocol and cryptographic primitives shared by every Skiff
//! crate.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod protocol;
pub mod types;

pub use config::TransferConfig;
pub use error::{CryptoError, KeyAgreementError};
pub use types::{EpochId, FileId, PeerId, PieceHash, RoomId, SecurityModeKind};
