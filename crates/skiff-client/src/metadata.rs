//! Chunked distribution of piece hash lists.
//!
//! A holder answers `MetadataRequest` by splitting the hash list into
//! index-addressed chunks; the requester collects them in any order and
//! reassembles once every index is present.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use skiff_shared::protocol::{FileMetadata, MetadataChunk, WireMessage};
use skiff_shared::types::{FileId, PieceHash};

/// Split `metadata`'s hash list into `MetadataPiece` messages.
///
/// An empty list still yields one empty chunk so the collector can complete.
pub fn split_into_chunks(metadata: &FileMetadata, chunk_size: usize) -> Vec<WireMessage> {
    let chunk_size = chunk_size.max(1);
    let hashes = &metadata.piece_hashes;
    let total_chunks = hashes.len().div_ceil(chunk_size).max(1) as u32;

    (0..total_chunks)
        .map(|i| {
            let start = i as usize * chunk_size;
            let end = (start + chunk_size).min(hashes.len());
            WireMessage::MetadataPiece(MetadataChunk {
                file_id: metadata.file_id,
                chunk_index: i,
                total_chunks,
                hashes: hashes[start.min(end)..end].to_vec(),
            })
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Already received this index; state unchanged.
    Duplicate,
    /// Inconsistent with chunks seen so far; ignored.
    Invalid,
    Pending { received: u32, total: u32 },
    /// Full hash list in index order.
    Complete(Vec<PieceHash>),
}

/// Accumulates the chunks of one file's hash list.
#[derive(Debug, Default)]
pub struct MetadataCollector {
    chunks: BTreeMap<u32, Vec<PieceHash>>,
    total_chunks: Option<u32>,
}

impl MetadataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk: MetadataChunk) -> ChunkOutcome {
        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            return ChunkOutcome::Invalid;
        }
        match self.total_chunks {
            Some(total) if total != chunk.total_chunks => return ChunkOutcome::Invalid,
            Some(_) => {}
            None => self.total_chunks = Some(chunk.total_chunks),
        }
        if self.chunks.contains_key(&chunk.chunk_index) {
            return ChunkOutcome::Duplicate;
        }

        self.chunks.insert(chunk.chunk_index, chunk.hashes);
        let received = self.chunks.len() as u32;
        let total = chunk.total_chunks;

        if received == total {
            // BTreeMap iterates in index order
            let hashes = self.chunks.values().flatten().copied().collect();
            ChunkOutcome::Complete(hashes)
        } else {
            ChunkOutcome::Pending { received, total }
        }
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    pub fn total(&self) -> Option<u32> {
        self.total_chunks
    }

    /// Drop everything received. Used when an assembled list failed validation.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.total_chunks = None;
    }
}

/// Collectors for every file whose hash list is in flight.
///
/// Request counts outlive a collector so a list that completes but fails
/// validation still counts against the retry limit.
#[derive(Debug, Default)]
pub struct MetadataDistribution {
    collectors: HashMap<FileId, MetadataCollector>,
    attempts: HashMap<FileId, u32>,
}

impl MetadataDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a request for `file_id` is being sent.
    ///
    /// Returns the number of requests sent including this one.
    pub fn record_request(&mut self, file_id: FileId) -> u32 {
        self.collectors.entry(file_id).or_default();
        let attempts = self.attempts.entry(file_id).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub fn is_collecting(&self, file_id: &FileId) -> bool {
        self.collectors.contains_key(file_id)
    }

    pub fn attempts(&self, file_id: &FileId) -> u32 {
        self.attempts.get(file_id).copied().unwrap_or(0)
    }

    /// Feed a received chunk. Chunks for files nobody asked about are ignored.
    ///
    /// On completion the collector is destroyed and the hash list returned.
    pub fn handle_chunk(&mut self, chunk: MetadataChunk) -> Option<Vec<PieceHash>> {
        let file_id = chunk.file_id;
        let chunk_index = chunk.chunk_index;
        let collector = self.collectors.get_mut(&file_id)?;

        match collector.insert(chunk) {
            ChunkOutcome::Complete(hashes) => {
                debug!(file_id = %file_id, hashes = hashes.len(), "Metadata assembled");
                self.collectors.remove(&file_id);
                Some(hashes)
            }
            ChunkOutcome::Pending { received, total } => {
                debug!(file_id = %file_id, chunk = chunk_index, received, total, "Metadata chunk received");
                None
            }
            ChunkOutcome::Duplicate => None,
            ChunkOutcome::Invalid => {
                warn!(file_id = %file_id, chunk = chunk_index, "Inconsistent metadata chunk ignored");
                None
            }
        }
    }

    /// Discard a partially collected list but keep the attempt count.
    pub fn restart(&mut self, file_id: FileId) {
        self.collectors.entry(file_id).or_default().reset();
    }

    /// Forget `file_id` entirely, attempt count included.
    pub fn cancel(&mut self, file_id: &FileId) {
        self.collectors.remove(file_id);
        self.attempts.remove(file_id);
    }

    pub fn clear(&mut self) {
        self.collectors.clear();
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pieces: usize) -> FileMetadata {
        FileMetadata {
            file_id: FileId::new(),
            file_name: "big.iso".into(),
            file_size: pieces as u64 * 16,
            file_type: "application/octet-stream".into(),
            piece_hashes: (0..pieces)
                .map(|i| PieceHash::of(&(i as u32).to_be_bytes()))
                .collect(),
        }
    }

    fn chunks_of(messages: Vec<WireMessage>) -> Vec<MetadataChunk> {
        messages
            .into_iter()
            .map(|m| match m {
                WireMessage::MetadataPiece(c) => c,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_split_counts() {
        let meta = metadata(1201);
        let chunks = chunks_of(split_into_chunks(&meta, 500));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        assert_eq!(chunks[2].hashes.len(), 201);

        let empty = chunks_of(split_into_chunks(&metadata(0), 500));
        assert_eq!(empty.len(), 1);
        assert!(empty[0].hashes.is_empty());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let meta = metadata(1201);
        let mut chunks = chunks_of(split_into_chunks(&meta, 500));
        chunks.reverse();

        let mut dist = MetadataDistribution::new();
        dist.record_request(meta.file_id);

        assert!(dist.handle_chunk(chunks[0].clone()).is_none());
        assert!(dist.handle_chunk(chunks[1].clone()).is_none());
        let hashes = dist.handle_chunk(chunks[2].clone()).unwrap();

        assert_eq!(hashes, meta.piece_hashes);
        assert!(!dist.is_collecting(&meta.file_id));
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let meta = metadata(1000);
        let chunks = chunks_of(split_into_chunks(&meta, 400));

        let mut collector = MetadataCollector::new();
        assert_eq!(
            collector.insert(chunks[1].clone()),
            ChunkOutcome::Pending {
                received: 1,
                total: 3
            }
        );

        // A second copy with different content must not replace the first
        let mut forged = chunks[1].clone();
        forged.hashes.reverse();
        assert_eq!(collector.insert(forged), ChunkOutcome::Duplicate);
        assert_eq!(collector.received(), 1);

        collector.insert(chunks[0].clone());
        match collector.insert(chunks[2].clone()) {
            ChunkOutcome::Complete(hashes) => assert_eq!(hashes, meta.piece_hashes),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_inconsistent_total_rejected() {
        let meta = metadata(10);
        let mut collector = MetadataCollector::new();
        let mut chunks = chunks_of(split_into_chunks(&meta, 4));

        collector.insert(chunks.remove(0));
        let mut bad = chunks.remove(0);
        bad.total_chunks = 9;
        assert_eq!(collector.insert(bad), ChunkOutcome::Invalid);

        let out_of_range = MetadataChunk {
            file_id: meta.file_id,
            chunk_index: 3,
            total_chunks: 3,
            hashes: vec![],
        };
        assert_eq!(collector.insert(out_of_range), ChunkOutcome::Invalid);
    }

    #[test]
    fn test_unrequested_chunks_ignored() {
        let meta = metadata(3);
        let mut dist = MetadataDistribution::new();
        let chunk = chunks_of(split_into_chunks(&meta, 500)).remove(0);
        assert!(dist.handle_chunk(chunk).is_none());
        assert!(!dist.is_collecting(&meta.file_id));
    }

    #[test]
    fn test_restart_keeps_attempts() {
        let meta = metadata(10);
        let mut dist = MetadataDistribution::new();
        dist.record_request(meta.file_id);
        dist.record_request(meta.file_id);

        let chunk = chunks_of(split_into_chunks(&meta, 4)).remove(0);
        dist.handle_chunk(chunk);
        dist.restart(meta.file_id);

        assert_eq!(dist.attempts(&meta.file_id), 2);
        assert!(dist.is_collecting(&meta.file_id));
    }

    #[test]
    fn test_attempts_survive_completion() {
        let meta = metadata(3);
        let mut dist = MetadataDistribution::new();
        dist.record_request(meta.file_id);

        let chunk = chunks_of(split_into_chunks(&meta, 500)).remove(0);
        assert!(dist.handle_chunk(chunk).is_some());
        assert!(!dist.is_collecting(&meta.file_id));
        assert_eq!(dist.attempts(&meta.file_id), 1);

        dist.cancel(&meta.file_id);
        assert_eq!(dist.attempts(&meta.file_id), 0);
    }
}
