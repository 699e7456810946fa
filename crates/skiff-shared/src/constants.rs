/// AES-GCM nonce (IV) size in bytes
pub const NONCE_SIZE: usize = 12;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for AES-256-GCM)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// BLAKE3 digest size in bytes
pub const HASH_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 rounds for password-protected rooms
pub const PBKDF2_ITERATIONS: u32 = 310_000;

/// Piece size in bytes (128 KiB)
pub const DEFAULT_PIECE_SIZE: usize = 128 * 1024;

/// Upper bound on simultaneously outstanding piece requests per download
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Piece request timeout in milliseconds
pub const DEFAULT_PIECE_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Number of piece hashes carried by one metadata chunk
pub const DEFAULT_METADATA_CHUNK_SIZE: usize = 500;

/// Epoch key rotation period in milliseconds
pub const DEFAULT_REKEY_INTERVAL_MS: u64 = 60_000;

/// Files below this size are assembled through the piece store (100 MiB)
pub const DEFAULT_ASSEMBLY_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Presence broadcast period in milliseconds
pub const DEFAULT_PRESENCE_INTERVAL_MS: u64 = 5_000;

/// A member silent for longer than this is pruned (milliseconds)
pub const DEFAULT_ONLINE_TIMEOUT_MS: u64 = 15_000;

/// Backoff before re-running source discovery when no seeder is known
pub const DEFAULT_NO_SEEDER_RETRY_MS: u64 = 5_000;

/// Metadata request timeout in milliseconds
pub const DEFAULT_METADATA_TIMEOUT_MS: u64 = 10_000;

/// Metadata requests sent before a download is abandoned
pub const DEFAULT_METADATA_MAX_ATTEMPTS: u32 = 5;

/// Chat lines remembered per room for late joiners
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Subdirectory of the system temp dir used when no download dir is set
pub const DEFAULT_DOWNLOAD_SUBDIR: &str = "skiff-downloads";

/// How far ahead of the local clock a member's reported epoch may be
/// before it is ignored when choosing the next epoch id
pub const MAX_EPOCH_CLOCK_SKEW_MS: u64 = 60 * 60 * 1000;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_EPOCH_WRAP: &str = "skiff-epoch-wrap-key-v1";
