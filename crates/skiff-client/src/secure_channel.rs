//! Envelope sealing per room security mode.
//!
//! Three modes are supported:
//! - `Open`: plaintext, tagged so receivers skip decryption.
//! - `Password`: AES-256-GCM under a PBKDF2 key derived from the room
//!   password, salted with the room id.
//! - `ForwardSecure`: AES-256-GCM under the room's current epoch key, with
//!   the epoch id bound as associated data.
//!
//! Any failure to open an envelope collapses into
//! [`ClientError::AuthFailure`].

use std::collections::HashMap;

use tracing::{debug, info};

use skiff_shared::crypto::{self, SymmetricKey};
use skiff_shared::protocol::Envelope;
use skiff_shared::types::{EpochId, RoomId, SecurityModeKind};

use crate::epoch::{epoch_aad, EpochKey};
use crate::error::{ClientError, Result};

/// How confidential payloads in a room are protected.
#[derive(Clone, PartialEq, Eq)]
pub enum SecurityMode {
    Open,
    Password(String),
    ForwardSecure,
}

impl SecurityMode {
    pub fn kind(&self) -> SecurityModeKind {
        match self {
            SecurityMode::Open => SecurityModeKind::Open,
            SecurityMode::Password(_) => SecurityModeKind::Password,
            SecurityMode::ForwardSecure => SecurityModeKind::ForwardSecure,
        }
    }
}

impl std::fmt::Debug for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::Open => f.write_str("Open"),
            SecurityMode::Password(_) => f.write_str("Password(..)"),
            SecurityMode::ForwardSecure => f.write_str("ForwardSecure"),
        }
    }
}

/// The room a session is in and the key material it currently holds.
#[derive(Debug, Clone)]
pub struct RoomContext {
    pub room_id: RoomId,
    pub mode: SecurityMode,
    epoch_key: Option<EpochKey>,
}

impl RoomContext {
    pub fn new(room_id: RoomId, mode: SecurityMode) -> Self {
        Self {
            room_id,
            mode,
            epoch_key: None,
        }
    }

    pub fn epoch_key(&self) -> Option<&EpochKey> {
        self.epoch_key.as_ref()
    }

    pub fn current_epoch(&self) -> Option<EpochId> {
        self.epoch_key.as_ref().map(|k| k.epoch_id)
    }

    /// Adopt `key` only if its epoch is strictly newer than the held one.
    ///
    /// Returns `true` when the key was adopted.
    pub fn adopt_epoch_key(&mut self, key: EpochKey) -> bool {
        if let Some(current) = self.current_epoch() {
            if key.epoch_id <= current {
                debug!(
                    room = %self.room_id,
                    held = %current,
                    offered = %key.epoch_id,
                    "Rejected stale epoch key"
                );
                return false;
            }
        }
        info!(room = %self.room_id, epoch_id = %key.epoch_id, "Epoch key adopted");
        self.epoch_key = Some(key);
        true
    }

    pub fn clear_epoch_key(&mut self) {
        self.epoch_key = None;
    }
}

/// Seals and opens envelopes, caching password-derived keys for the
/// lifetime of the session.
#[derive(Default)]
pub struct SecureChannel {
    password_keys: HashMap<(String, RoomId), SymmetricKey>,
}

impl SecureChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and cache the password key for `room` ahead of the first
    /// message. No-op outside password rooms.
    pub async fn prime(&mut self, room: &RoomContext) -> Result<()> {
        if let SecurityMode::Password(password) = &room.mode {
            self.password_key(password, &room.room_id).await?;
        }
        Ok(())
    }

    /// Seal `plaintext` according to the room's mode.
    pub async fn seal(&mut self, plaintext: &[u8], room: &RoomContext) -> Result<Envelope> {
        match &room.mode {
            SecurityMode::Open => Ok(Envelope::Open(plaintext.to_vec())),
            SecurityMode::Password(password) => {
                let key = self.password_key(password, &room.room_id).await?;
                Ok(Envelope::Password(crypto::encrypt(&key, plaintext)?))
            }
            SecurityMode::ForwardSecure => {
                let epoch = room.epoch_key().ok_or(ClientError::KeyNotReady)?;
                let sealed =
                    crypto::encrypt_with_aad(&epoch.key, plaintext, &epoch_aad(epoch.epoch_id))?;
                Ok(Envelope::ForwardSecure {
                    epoch_id: epoch.epoch_id,
                    sealed,
                })
            }
        }
    }

    /// Open an envelope received in `room`.
    ///
    /// The envelope's mode must match the room's; an `Open` envelope in a
    /// protected room is rejected.
    pub async fn open(&mut self, envelope: &Envelope, room: &RoomContext) -> Result<Vec<u8>> {
        if envelope.mode() != room.mode.kind() {
            debug!(
                room = %room.room_id,
                envelope = ?envelope.mode(),
                "Envelope mode does not match room"
            );
            return Err(ClientError::AuthFailure);
        }

        match (envelope, &room.mode) {
            (Envelope::Open(bytes), _) => Ok(bytes.clone()),
            (Envelope::Password(sealed), SecurityMode::Password(password)) => {
                let key = self.password_key(password, &room.room_id).await?;
                crypto::decrypt(&key, sealed).map_err(|_| ClientError::AuthFailure)
            }
            (Envelope::ForwardSecure { epoch_id, sealed }, SecurityMode::ForwardSecure) => {
                let held = room.epoch_key().ok_or(ClientError::AuthFailure)?;
                if held.epoch_id != *epoch_id {
                    debug!(held = %held.epoch_id, got = %epoch_id, "Envelope sealed under another epoch");
                    return Err(ClientError::AuthFailure);
                }
                crypto::decrypt_with_aad(&held.key, sealed, &epoch_aad(*epoch_id))
                    .map_err(|_| ClientError::AuthFailure)
            }
            _ => Err(ClientError::AuthFailure),
        }
    }

    /// Number of derived password keys held.
    pub fn cached_keys(&self) -> usize {
        self.password_keys.len()
    }

    async fn password_key(&mut self, password: &str, room_id: &RoomId) -> Result<SymmetricKey> {
        let cache_key = (password.to_owned(), room_id.clone());
        if let Some(key) = self.password_keys.get(&cache_key) {
            return Ok(*key);
        }

        let (pw, salt) = cache_key.clone();
        let key = tokio::task::spawn_blocking(move || {
            crypto::derive_password_key(&pw, salt.as_bytes())
        })
        .await?;

        debug!(room = %room_id, "Derived password key");
        self.password_keys.insert(cache_key, key);
        Ok(key)
    }
}
