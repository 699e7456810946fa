//! # skiff-store
//!
//! Piece persistence for downloads assembled below the size threshold.
//!
//! Pieces are addressed by `(file_id, piece_index)`. The crate exposes a
//! synchronous [`Database`] handle wrapping a `rusqlite::Connection`, and the
//! [`PieceStore`] trait the transfer engine writes through, with an in-memory
//! and a SQLite-backed implementation.

pub mod database;
pub mod migrations;
pub mod piece_store;
pub mod pieces;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use piece_store::{MemoryPieceStore, PieceStore, SqlitePieceStore};
