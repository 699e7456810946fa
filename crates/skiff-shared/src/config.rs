//! Transfer and keying configuration loaded from environment variables.
//!
//! All settings have sensible defaults so a session can start with zero
//! configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;

/// Tunables for the transfer engine, metadata distribution and epoch keying.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Piece size in bytes.
    /// Env: `SKIFF_PIECE_SIZE`
    pub piece_size: usize,

    /// Maximum simultaneously in-flight piece requests per download.
    /// Env: `SKIFF_MAX_CONCURRENT_REQUESTS`
    pub max_concurrent_requests: usize,

    /// Time a piece request may stay unanswered before it is re-dispatched.
    /// Env: `SKIFF_PIECE_TIMEOUT_MS`
    pub piece_request_timeout: Duration,

    /// Number of piece hashes per metadata chunk.
    /// Env: `SKIFF_METADATA_CHUNK_SIZE`
    pub metadata_chunk_size: usize,

    /// Epoch key rotation period.
    /// Env: `SKIFF_REKEY_INTERVAL_MS`
    pub rekey_interval: Duration,

    /// Files strictly smaller than this are assembled through the piece
    /// store; larger ones stream to disk.
    /// Env: `SKIFF_ASSEMBLY_THRESHOLD`
    pub assembly_threshold: u64,

    /// Presence broadcast period.
    /// Env: `SKIFF_PRESENCE_INTERVAL_MS`
    pub presence_interval: Duration,

    /// Silence after which a member is considered gone.
    /// Env: `SKIFF_ONLINE_TIMEOUT_MS`
    pub online_timeout: Duration,

    /// Backoff before source discovery is retried for a seederless file.
    /// Env: `SKIFF_NO_SEEDER_RETRY_MS`
    pub no_seeder_retry: Duration,

    /// Time to wait for a complete hash list before re-requesting it.
    /// Env: `SKIFF_METADATA_TIMEOUT_MS`
    pub metadata_timeout: Duration,

    /// Metadata requests sent before a download is abandoned.
    /// Env: `SKIFF_METADATA_MAX_ATTEMPTS`
    pub metadata_max_attempts: u32,

    /// Chat lines kept for late joiners in open and password rooms.
    /// `0` disables history sync.
    /// Env: `SKIFF_HISTORY_LIMIT`
    pub history_limit: usize,

    /// Directory receiving streamed downloads and partial files.
    /// Env: `SKIFF_DOWNLOAD_DIR`
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            piece_request_timeout: Duration::from_millis(DEFAULT_PIECE_REQUEST_TIMEOUT_MS),
            metadata_chunk_size: DEFAULT_METADATA_CHUNK_SIZE,
            rekey_interval: Duration::from_millis(DEFAULT_REKEY_INTERVAL_MS),
            assembly_threshold: DEFAULT_ASSEMBLY_THRESHOLD,
            presence_interval: Duration::from_millis(DEFAULT_PRESENCE_INTERVAL_MS),
            online_timeout: Duration::from_millis(DEFAULT_ONLINE_TIMEOUT_MS),
            no_seeder_retry: Duration::from_millis(DEFAULT_NO_SEEDER_RETRY_MS),
            metadata_timeout: Duration::from_millis(DEFAULT_METADATA_TIMEOUT_MS),
            metadata_max_attempts: DEFAULT_METADATA_MAX_ATTEMPTS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            download_dir: std::env::temp_dir().join(DEFAULT_DOWNLOAD_SUBDIR),
        }
    }
}

impl TransferConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("SKIFF_PIECE_SIZE") {
            if v > 0 {
                config.piece_size = v;
            }
        }

        if let Some(v) = env_parse::<usize>("SKIFF_MAX_CONCURRENT_REQUESTS") {
            if v > 0 {
                config.max_concurrent_requests = v;
            }
        }

        if let Some(ms) = env_parse::<u64>("SKIFF_PIECE_TIMEOUT_MS") {
            config.piece_request_timeout = Duration::from_millis(ms);
        }

        if let Some(v) = env_parse::<usize>("SKIFF_METADATA_CHUNK_SIZE") {
            if v > 0 {
                config.metadata_chunk_size = v;
            }
        }

        if let Some(ms) = env_parse::<u64>("SKIFF_REKEY_INTERVAL_MS") {
            config.rekey_interval = Duration::from_millis(ms);
        }

        if let Some(v) = env_parse::<u64>("SKIFF_ASSEMBLY_THRESHOLD") {
            config.assembly_threshold = v;
        }

        if let Some(ms) = env_parse::<u64>("SKIFF_PRESENCE_INTERVAL_MS") {
            config.presence_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("SKIFF_ONLINE_TIMEOUT_MS") {
            config.online_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("SKIFF_NO_SEEDER_RETRY_MS") {
            config.no_seeder_retry = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("SKIFF_METADATA_TIMEOUT_MS") {
            config.metadata_timeout = Duration::from_millis(ms);
        }

        if let Some(v) = env_parse::<u32>("SKIFF_METADATA_MAX_ATTEMPTS") {
            config.metadata_max_attempts = v.max(1);
        }

        if let Some(v) = env_parse::<usize>("SKIFF_HISTORY_LIMIT") {
            config.history_limit = v;
        }

        if let Ok(dir) = std::env::var("SKIFF_DOWNLOAD_DIR") {
            if !dir.trim().is_empty() {
                config.download_dir = PathBuf::from(dir);
            }
        }

        config
    }

    /// Number of pieces a file of `file_size` bytes splits into, or `None`
    /// when that does not fit a `u32` piece index.
    pub fn piece_count(&self, file_size: u64) -> Option<u32> {
        u32::try_from(file_size.div_ceil(self.piece_size as u64)).ok()
    }

    /// Byte range `[start, end)` of piece `index` within a file of `file_size` bytes.
    pub fn piece_range(&self, index: u32, file_size: u64) -> (u64, u64) {
        let start = index as u64 * self.piece_size as u64;
        let end = (start + self.piece_size as u64).min(file_size);
        (start.min(file_size), end)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
