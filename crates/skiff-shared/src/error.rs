use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

#[derive(Error, Debug)]
pub enum KeyAgreementError {
    #[error("Invalid public key bytes")]
    InvalidPublicKey,

    #[error("Key agreement produced a non-contributory shared secret")]
    NonContributory,
}
