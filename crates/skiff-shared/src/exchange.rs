use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::PUBKEY_SIZE;
use crate::crypto::{derive_wrap_key, SymmetricKey};
use crate::error::KeyAgreementError;

/// A peer's key agreement keypair for one forward-secure room.
/// The secret half never leaves this struct; a fresh pair is generated on
/// every room entry and dropped on room switch.
pub struct EpochKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EpochKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the raw public key bytes (what gets announced)
    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.public.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Derive the pairwise wrap key shared with `peer`.
    ///
    /// Symmetric: A's secret with B's public yields the same key as B's
    /// secret with A's public.
    pub fn pairwise_key(&self, peer: &PublicKey) -> Result<SymmetricKey, KeyAgreementError> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(KeyAgreementError::NonContributory);
        }
        Ok(derive_wrap_key(shared.as_bytes()))
    }
}

impl std::fmt::Debug for EpochKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Import an announced public key.
pub fn import_public_key(bytes: &[u8]) -> Result<PublicKey, KeyAgreementError> {
    let arr: [u8; PUBKEY_SIZE] = bytes
        .try_into()
        .map_err(|_| KeyAgreementError::InvalidPublicKey)?;
    Ok(PublicKey::from(arr))
}
