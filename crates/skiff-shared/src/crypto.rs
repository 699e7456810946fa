use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::constants::{KDF_CONTEXT_EPOCH_WRAP, NONCE_SIZE, PBKDF2_ITERATIONS, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// IV and ciphertext (AES-256-GCM, tag appended to the ciphertext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub iv: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Fresh random IV on every call
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    encrypt_with_aad(key, plaintext, &[])
}

pub fn encrypt_with_aad(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let iv = generate_nonce();

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Sealed { iv, ciphertext })
}

pub fn decrypt(key: &SymmetricKey, sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
    decrypt_with_aad(key, sealed, &[])
}

pub fn decrypt_with_aad(
    key: &SymmetricKey,
    sealed: &Sealed,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;

    cipher
        .decrypt(
            Nonce::from_slice(&sealed.iv),
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// PBKDF2-HMAC-SHA256 with the room id as salt. Slow: callers
/// cache the result and run it off the event loop.
pub fn derive_password_key(password: &str, room_id: &[u8]) -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), room_id, PBKDF2_ITERATIONS, &mut key);
    key
}

// BLAKE3 KDF with domain separation
pub fn derive_wrap_key(shared_secret: &[u8; 32]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_EPOCH_WRAP);
    hasher.update(shared_secret);
    *hasher.finalize().as_bytes()
}
