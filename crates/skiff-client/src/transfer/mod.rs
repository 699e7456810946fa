//! Piece-based file transfer.
//!
//! Sending side: a shared file is registered as an [`OutgoingTransfer`],
//! announced over chat, and served one piece per `PieceRequest` addressed to
//! us.
//!
//! Receiving side: each piece moves `Pending → Requested → Done`, falling
//! back to `Pending` on timeout, authentication failure or hash mismatch. At
//! most `max_concurrent_requests` pieces are in flight per download, spread
//! round-robin over the known seeders.

pub mod seeders;
pub mod sink;

use std::collections::HashMap;
use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

use skiff_shared::protocol::{
    ChatPayload, Envelope, FileAnnouncement, FileMetadata, MetadataChunk, WireMessage,
};
use skiff_shared::types::{FileId, PeerId, PieceHash};

use crate::context::SessionContext;
use crate::error::{ClientError, Result};
use crate::events::{Artifact, ClientEvent};
use crate::metadata::{split_into_chunks, MetadataDistribution};
use crate::secure_channel::SecureChannel;
use crate::timers::{TimerKind, Timers};

pub use seeders::SeederSet;
pub use sink::PieceSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PieceStatus {
    Pending,
    Requested,
    Done,
}

/// Where a seeded file's bytes live.
#[derive(Debug, Clone)]
enum Source {
    Memory(Arc<Vec<u8>>),
    Disk(PathBuf),
}

impl Source {
    async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
        match self {
            Source::Memory(bytes) => bytes
                .get(start as usize..end as usize)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "range past end of file")
                }),
            Source::Disk(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

/// A file this peer holds completely and serves.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub metadata: FileMetadata,
    source: Source,
}

struct PieceBook {
    hashes: Vec<PieceHash>,
    status: Vec<PieceStatus>,
    /// piece index → seeder asked
    in_flight: HashMap<u32, PeerId>,
    /// piece index → seeder that last failed to deliver it
    last_failed: HashMap<u32, PeerId>,
    received: u32,
    sink: Option<PieceSink>,
}

impl PieceBook {
    fn new(hashes: Vec<PieceHash>, sink: PieceSink) -> Self {
        let status = vec![PieceStatus::Pending; hashes.len()];
        Self {
            hashes,
            status,
            in_flight: HashMap::new(),
            last_failed: HashMap::new(),
            received: 0,
            sink: Some(sink),
        }
    }

    fn total(&self) -> u32 {
        self.hashes.len() as u32
    }

    fn next_pending(&self) -> Option<u32> {
        self.status
            .iter()
            .position(|s| *s == PieceStatus::Pending)
            .map(|i| i as u32)
    }

    fn is_requested(&self, index: u32) -> bool {
        self.status.get(index as usize) == Some(&PieceStatus::Requested)
    }

    /// `Requested → Pending`, remembering which seeder let us down.
    fn revert(&mut self, index: u32) {
        if let Some(status) = self.status.get_mut(index as usize) {
            *status = PieceStatus::Pending;
        }
        if let Some(seeder) = self.in_flight.remove(&index) {
            self.last_failed.insert(index, seeder);
        }
    }
}

/// A download in progress.
pub struct IncomingTransfer {
    pub announcement: FileAnnouncement,
    pub seeders: SeederSet,
    /// `None` until the hash list has been collected.
    book: Option<PieceBook>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub file_id: FileId,
    pub file_name: String,
    pub received: u32,
    pub total: u32,
    pub in_flight: usize,
    pub seeders: usize,
    pub has_metadata: bool,
}

#[derive(Default)]
pub struct TransferEngine {
    /// Files announced in the current room.
    known: HashMap<FileId, FileAnnouncement>,
    outgoing: HashMap<FileId, OutgoingTransfer>,
    incoming: HashMap<FileId, IncomingTransfer>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Sending side
    // ------------------------------------------------------------------

    /// Hash a file on disk, start seeding it and announce it to the room.
    pub async fn share_file(
        &mut self,
        ctx: &SessionContext,
        channel: &mut SecureChannel,
        path: &Path,
    ) -> Result<FileAnnouncement> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let file_type = guess_file_type(path).to_string();

        let piece_size = ctx.config.piece_size;
        let owned = path.to_path_buf();
        let (file_size, piece_hashes) =
            tokio::task::spawn_blocking(move || hash_file(&owned, piece_size)).await??;

        let metadata = FileMetadata {
            file_id: FileId::new(),
            file_name,
            file_size,
            file_type,
            piece_hashes,
        };
        self.announce_local_file(ctx, channel, metadata, Source::Disk(path.to_path_buf()))
            .await
    }

    /// Seed an in-memory buffer and announce it to the room.
    pub async fn share_bytes(
        &mut self,
        ctx: &SessionContext,
        channel: &mut SecureChannel,
        file_name: String,
        file_type: String,
        data: Vec<u8>,
    ) -> Result<FileAnnouncement> {
        let data = Arc::new(data);
        let piece_size = ctx.config.piece_size;
        let hashed = Arc::clone(&data);
        let piece_hashes =
            tokio::task::spawn_blocking(move || hash_pieces(&hashed, piece_size)).await?;

        let metadata = FileMetadata {
            file_id: FileId::new(),
            file_name,
            file_size: data.len() as u64,
            file_type,
            piece_hashes,
        };
        self.announce_local_file(ctx, channel, metadata, Source::Memory(data))
            .await
    }

    async fn announce_local_file(
        &mut self,
        ctx: &SessionContext,
        channel: &mut SecureChannel,
        metadata: FileMetadata,
        source: Source,
    ) -> Result<FileAnnouncement> {
        let announcement = metadata.announcement();
        let payload = ChatPayload::FileAnnounce(announcement.clone()).to_bytes()?;
        let envelope = channel.seal(&payload, &ctx.room).await?;

        info!(
            file_id = %metadata.file_id,
            name = %metadata.file_name,
            size = metadata.file_size,
            pieces = metadata.piece_count(),
            "Seeding local file"
        );
        self.outgoing
            .insert(metadata.file_id, OutgoingTransfer { metadata, source });

        ctx.publish(WireMessage::Chat(envelope)).await?;
        Ok(announcement)
    }

    /// Answer discovery for files we hold.
    pub async fn handle_source_request(&self, ctx: &SessionContext, sender: &PeerId, file_id: FileId) {
        if !self.outgoing.contains_key(&file_id) {
            return;
        }
        debug!(file_id = %file_id, peer = %sender, "Answering source request");
        if let Err(e) = ctx.publish(WireMessage::SourceAnnounce { file_id }).await {
            warn!(file_id = %file_id, error = %e, "Failed to announce source");
        }
    }

    /// Publish the hash list of a held file as chunks.
    pub async fn handle_metadata_request(&self, ctx: &SessionContext, sender: &PeerId, file_id: FileId) {
        let Some(outgoing) = self.outgoing.get(&file_id) else {
            return;
        };

        let chunks = split_into_chunks(&outgoing.metadata, ctx.config.metadata_chunk_size);
        debug!(file_id = %file_id, peer = %sender, chunks = chunks.len(), "Serving metadata");
        for chunk in chunks {
            if let Err(e) = ctx.publish(chunk).await {
                warn!(file_id = %file_id, error = %e, "Failed to publish metadata chunk");
                break;
            }
        }
    }

    /// Serve one piece if the request is addressed to us and the file is held.
    pub async fn handle_piece_request(
        &self,
        ctx: &SessionContext,
        channel: &mut SecureChannel,
        requester: &PeerId,
        file_id: FileId,
        piece_index: u32,
        target_seeder: &PeerId,
    ) -> Result<()> {
        if target_seeder != &ctx.local_id {
            return Ok(());
        }
        let outgoing = self
            .outgoing
            .get(&file_id)
            .ok_or(ClientError::UnknownFile(file_id))?;

        if piece_index >= outgoing.metadata.piece_count() {
            warn!(file_id = %file_id, piece = piece_index, peer = %requester, "Piece index out of range");
            return Ok(());
        }

        let (start, end) = ctx
            .config
            .piece_range(piece_index, outgoing.metadata.file_size);
        let bytes = outgoing.source.read_range(start, end).await?;
        let envelope = channel.seal(&bytes, &ctx.room).await?;

        debug!(file_id = %file_id, piece = piece_index, peer = %requester, len = bytes.len(), "Serving piece");
        ctx.publish(WireMessage::FilePiece {
            file_id,
            piece_index,
            envelope,
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receiving side
    // ------------------------------------------------------------------

    /// Remember a file announced in the room.
    pub fn register_announcement(
        &mut self,
        ctx: &SessionContext,
        sender: &PeerId,
        announcement: FileAnnouncement,
    ) {
        if ctx.config.piece_count(announcement.file_size) != Some(announcement.piece_count) {
            warn!(
                file_id = %announcement.file_id,
                size = announcement.file_size,
                pieces = announcement.piece_count,
                peer = %sender,
                "Announcement piece count does not match file size, ignoring"
            );
            return;
        }
        debug!(
            file_id = %announcement.file_id,
            name = %announcement.file_name,
            peer = %sender,
            "File announced"
        );
        self.known
            .insert(announcement.file_id, announcement.clone());
        ctx.emit(ClientEvent::FileAnnounced {
            sender: sender.clone(),
            announcement,
        });
    }

    /// Begin downloading an announced file.
    ///
    /// Starts with source discovery; piece requests follow once a seeder and
    /// the hash list are known.
    pub async fn start_download(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        file_id: FileId,
    ) -> Result<()> {
        if self.outgoing.contains_key(&file_id) || self.incoming.contains_key(&file_id) {
            return Ok(());
        }
        let announcement = self
            .known
            .get(&file_id)
            .cloned()
            .ok_or(ClientError::UnknownFile(file_id))?;

        info!(file_id = %file_id, name = %announcement.file_name, "Starting download");
        self.incoming.insert(
            file_id,
            IncomingTransfer {
                announcement,
                seeders: SeederSet::new(),
                book: None,
            },
        );
        self.discover(ctx, timers, file_id).await;
        Ok(())
    }

    /// Broadcast a source request and arm the retry backoff.
    async fn discover(&mut self, ctx: &SessionContext, timers: &mut Timers, file_id: FileId) {
        debug!(file_id = %file_id, "Requesting sources");
        if let Err(e) = ctx.publish(WireMessage::SourceRequest { file_id }).await {
            warn!(file_id = %file_id, error = %e, "Failed to publish source request");
        }
        timers.schedule(
            TimerKind::DownloadRetry { file_id },
            ctx.config.no_seeder_retry,
        );
    }

    pub async fn handle_source_announce(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        sender: &PeerId,
        file_id: FileId,
    ) {
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            return;
        };
        if !transfer.seeders.insert(sender.clone()) {
            return;
        }

        info!(file_id = %file_id, peer = %sender, seeders = transfer.seeders.len(), "Seeder discovered");
        ctx.emit(ClientEvent::SeedersUpdated {
            file_id,
            seeders: transfer.seeders.len(),
        });

        if transfer.book.is_some() {
            self.pump(ctx, timers, file_id).await;
        } else if !metadata.is_collecting(&file_id) {
            self.request_metadata(ctx, timers, metadata, file_id).await;
        }
    }

    async fn request_metadata(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        file_id: FileId,
    ) {
        let attempt = metadata.record_request(file_id);
        debug!(file_id = %file_id, attempt, "Requesting metadata");
        if let Err(e) = ctx.publish(WireMessage::MetadataRequest { file_id }).await {
            warn!(file_id = %file_id, error = %e, "Failed to publish metadata request");
        }
        timers.schedule(
            TimerKind::MetadataTimeout { file_id },
            ctx.config.metadata_timeout,
        );
    }

    /// Re-request metadata, or give up after the configured attempts.
    async fn retry_metadata(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        file_id: FileId,
    ) {
        if metadata.attempts(&file_id) >= ctx.config.metadata_max_attempts {
            self.fail_download(ctx, timers, metadata, file_id, "metadata unavailable")
                .await;
            return;
        }
        self.request_metadata(ctx, timers, metadata, file_id).await;
    }

    pub async fn handle_metadata_chunk(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        chunk: MetadataChunk,
    ) {
        let file_id = chunk.file_id;
        let awaiting = self
            .incoming
            .get(&file_id)
            .is_some_and(|t| t.book.is_none());
        if !awaiting {
            return;
        }

        if let Some(hashes) = metadata.handle_chunk(chunk) {
            timers.cancel(&TimerKind::MetadataTimeout { file_id });
            self.attach_metadata(ctx, timers, metadata, file_id, hashes)
                .await;
        }
    }

    /// Install a collected hash list and start requesting pieces.
    async fn attach_metadata(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        file_id: FileId,
        hashes: Vec<PieceHash>,
    ) {
        let Some(transfer) = self.incoming.get(&file_id) else {
            return;
        };
        let announcement = &transfer.announcement;
        let Some(expected) = ctx.config.piece_count(announcement.file_size) else {
            warn!(file_id = %file_id, size = announcement.file_size, "File too large to download");
            self.fail_download(ctx, timers, metadata, file_id, "file too large")
                .await;
            return;
        };
        if hashes.len() != expected as usize || announcement.piece_count != expected {
            warn!(
                file_id = %file_id,
                got = hashes.len(),
                expected,
                "Hash list does not match file size, discarding"
            );
            metadata.restart(file_id);
            self.retry_metadata(ctx, timers, metadata, file_id).await;
            return;
        }

        let file_metadata = FileMetadata {
            file_id,
            file_name: announcement.file_name.clone(),
            file_size: announcement.file_size,
            file_type: announcement.file_type.clone(),
            piece_hashes: hashes,
        };

        let sink = match PieceSink::open(ctx, &file_metadata).await {
            Ok(s) => s,
            Err(e) => {
                error!(file_id = %file_id, error = %e, "Could not open download sink");
                self.fail_download(ctx, timers, metadata, file_id, "sink unavailable")
                    .await;
                return;
            }
        };

        // The transfer may have been cancelled while the sink was opening
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            sink.abort().await;
            return;
        };

        let piece_count = file_metadata.piece_count();
        info!(
            file_id = %file_id,
            pieces = piece_count,
            sink = sink.kind(),
            "Metadata attached"
        );
        transfer.book = Some(PieceBook::new(file_metadata.piece_hashes, sink));
        metadata.cancel(&file_id);

        if piece_count == 0 {
            self.complete(ctx, timers, file_id).await;
        } else {
            self.pump(ctx, timers, file_id).await;
        }
    }

    /// Issue piece requests until the concurrency cap is reached.
    ///
    /// Returns the number of requests sent.
    pub async fn manage_download(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        file_id: FileId,
    ) -> Result<usize> {
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            return Ok(0);
        };
        let Some(book) = transfer.book.as_mut() else {
            return Ok(0);
        };
        if transfer.seeders.is_empty() {
            return Err(ClientError::NoSeeders(file_id));
        }

        let mut dispatched = 0;
        while book.in_flight.len() < ctx.config.max_concurrent_requests {
            let Some(index) = book.next_pending() else {
                break;
            };
            let Some(seeder) = transfer.seeders.pick(book.last_failed.get(&index)) else {
                break;
            };

            book.status[index as usize] = PieceStatus::Requested;
            book.in_flight.insert(index, seeder.clone());

            let request = WireMessage::PieceRequest {
                file_id,
                piece_index: index,
                target_seeder: seeder.clone(),
            };
            if let Err(e) = ctx.publish(request).await {
                book.status[index as usize] = PieceStatus::Pending;
                book.in_flight.remove(&index);
                return Err(e.into());
            }

            timers.schedule(
                TimerKind::PieceTimeout {
                    file_id,
                    piece_index: index,
                },
                ctx.config.piece_request_timeout,
            );
            debug!(file_id = %file_id, piece = index, peer = %seeder, "Piece requested");
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// `manage_download` with its failures turned into retries.
    async fn pump(&mut self, ctx: &SessionContext, timers: &mut Timers, file_id: FileId) {
        match self.manage_download(ctx, timers, file_id).await {
            Ok(_) => {}
            Err(ClientError::NoSeeders(_)) => self.discover(ctx, timers, file_id).await,
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "Dispatch failed, retrying later");
                timers.schedule(
                    TimerKind::DownloadRetry { file_id },
                    ctx.config.no_seeder_retry,
                );
            }
        }
    }

    /// Verify and store a received piece.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_file_piece(
        &mut self,
        ctx: &SessionContext,
        channel: &mut SecureChannel,
        timers: &mut Timers,
        sender: &PeerId,
        file_id: FileId,
        piece_index: u32,
        envelope: &Envelope,
    ) {
        let requested = self
            .incoming
            .get(&file_id)
            .and_then(|t| t.book.as_ref())
            .is_some_and(|b| b.is_requested(piece_index));
        if !requested {
            debug!(file_id = %file_id, piece = piece_index, peer = %sender, "Ignoring unrequested piece");
            return;
        }

        let opened = channel.open(envelope, &ctx.room).await;

        // Re-check: the download may have moved on while we were decrypting
        let Some(book) = self
            .incoming
            .get_mut(&file_id)
            .and_then(|t| t.book.as_mut())
        else {
            return;
        };
        if !book.is_requested(piece_index) {
            return;
        }

        let data = match opened {
            Ok(d) => d,
            Err(e) => {
                warn!(file_id = %file_id, piece = piece_index, peer = %sender, error = %e, "Piece failed authentication");
                book.revert(piece_index);
                timers.cancel(&TimerKind::PieceTimeout { file_id, piece_index });
                self.pump(ctx, timers, file_id).await;
                return;
            }
        };

        if !book.hashes[piece_index as usize].verify(&data) {
            let e = ClientError::HashMismatch {
                file_id,
                piece: piece_index,
            };
            warn!(peer = %sender, error = %e, "Rejecting piece");
            book.revert(piece_index);
            timers.cancel(&TimerKind::PieceTimeout { file_id, piece_index });
            self.pump(ctx, timers, file_id).await;
            return;
        }

        timers.cancel(&TimerKind::PieceTimeout { file_id, piece_index });
        book.status[piece_index as usize] = PieceStatus::Done;
        book.in_flight.remove(&piece_index);
        book.last_failed.remove(&piece_index);
        book.received += 1;

        let offset = piece_index as u64 * ctx.config.piece_size as u64;
        let written = match book.sink.as_mut() {
            Some(sink) => sink.write(piece_index, offset, data).await,
            None => Ok(()),
        };
        if let Err(e) = written {
            error!(file_id = %file_id, piece = piece_index, error = %e, "Failed to write piece");
            book.status[piece_index as usize] = PieceStatus::Pending;
            book.received -= 1;
            self.pump(ctx, timers, file_id).await;
            return;
        }

        let (received, total) = (book.received, book.total());
        debug!(file_id = %file_id, piece = piece_index, received, total, "Piece verified");
        ctx.emit(ClientEvent::DownloadProgress {
            file_id,
            received,
            total,
        });

        if received == total {
            self.complete(ctx, timers, file_id).await;
        } else {
            self.pump(ctx, timers, file_id).await;
        }
    }

    /// React to a fired timer.
    pub async fn handle_timer(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        kind: TimerKind,
    ) {
        match kind {
            TimerKind::PieceTimeout {
                file_id,
                piece_index,
            } => {
                let Some(book) = self
                    .incoming
                    .get_mut(&file_id)
                    .and_then(|t| t.book.as_mut())
                else {
                    return;
                };
                if !book.is_requested(piece_index) {
                    return;
                }
                let seeder = book.in_flight.get(&piece_index).cloned();
                book.revert(piece_index);
                warn!(
                    file_id = %file_id,
                    piece = piece_index,
                    peer = ?seeder,
                    "Piece request timed out"
                );
                self.pump(ctx, timers, file_id).await;
            }
            TimerKind::DownloadRetry { file_id } => {
                let Some(transfer) = self.incoming.get(&file_id) else {
                    return;
                };
                if transfer.seeders.is_empty() {
                    self.discover(ctx, timers, file_id).await;
                } else if transfer.book.is_some() {
                    self.pump(ctx, timers, file_id).await;
                } else if !metadata.is_collecting(&file_id) {
                    self.request_metadata(ctx, timers, metadata, file_id).await;
                }
            }
            TimerKind::MetadataTimeout { file_id } => {
                let awaiting = self
                    .incoming
                    .get(&file_id)
                    .is_some_and(|t| t.book.is_none());
                if awaiting {
                    debug!(file_id = %file_id, "Metadata request timed out");
                    self.retry_metadata(ctx, timers, metadata, file_id).await;
                }
            }
        }
    }

    /// Finalize the sink and start seeding the finished file.
    async fn complete(&mut self, ctx: &SessionContext, timers: &mut Timers, file_id: FileId) {
        timers.cancel_file(&file_id);
        let Some(transfer) = self.incoming.remove(&file_id) else {
            return;
        };
        let Some(mut book) = transfer.book else {
            return;
        };
        let Some(sink) = book.sink.take() else {
            return;
        };

        let announcement = transfer.announcement;
        let artifact = match sink.finalize(book.total()).await {
            Ok(a) => a,
            Err(e) => {
                error!(file_id = %file_id, error = %e, "Failed to finalize download");
                ctx.emit(ClientEvent::DownloadFailed {
                    file_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let source = match &artifact {
            Artifact::Memory(bytes) => Source::Memory(Arc::clone(bytes)),
            Artifact::Disk(path) => Source::Disk(path.clone()),
        };
        let metadata = FileMetadata {
            file_id,
            file_name: announcement.file_name.clone(),
            file_size: announcement.file_size,
            file_type: announcement.file_type.clone(),
            piece_hashes: book.hashes,
        };
        self.outgoing
            .insert(file_id, OutgoingTransfer { metadata, source });

        info!(file_id = %file_id, name = %announcement.file_name, "Download complete, now seeding");
        ctx.emit(ClientEvent::DownloadComplete {
            file_id,
            file_name: announcement.file_name,
            artifact,
        });
    }

    /// Abort a download: stop its timers, discard stored bytes and forget
    /// it so late responses are ignored.
    pub async fn cancel_download(
        &mut self,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        file_id: FileId,
    ) -> Result<()> {
        let transfer = self
            .incoming
            .remove(&file_id)
            .ok_or(ClientError::UnknownFile(file_id))?;

        timers.cancel_file(&file_id);
        metadata.cancel(&file_id);
        if let Some(sink) = transfer.book.and_then(|mut b| b.sink.take()) {
            sink.abort().await;
        }
        info!(file_id = %file_id, "Download cancelled");
        Ok(())
    }

    async fn fail_download(
        &mut self,
        ctx: &SessionContext,
        timers: &mut Timers,
        metadata: &mut MetadataDistribution,
        file_id: FileId,
        reason: &str,
    ) {
        if self.cancel_download(timers, metadata, file_id).await.is_ok() {
            warn!(file_id = %file_id, reason, "Download failed");
            ctx.emit(ClientEvent::DownloadFailed {
                file_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop every room-scoped transfer. Seeded files are kept.
    pub async fn reset_room(&mut self, timers: &mut Timers, metadata: &mut MetadataDistribution) {
        let ids: Vec<FileId> = self.incoming.keys().copied().collect();
        for file_id in ids {
            let _ = self.cancel_download(timers, metadata, file_id).await;
        }
        self.known.clear();
        metadata.clear();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn download_status(&self, file_id: &FileId) -> Option<DownloadStatus> {
        let transfer = self.incoming.get(file_id)?;
        let book = transfer.book.as_ref();
        Some(DownloadStatus {
            file_id: *file_id,
            file_name: transfer.announcement.file_name.clone(),
            received: book.map_or(0, |b| b.received),
            total: transfer.announcement.piece_count,
            in_flight: book.map_or(0, |b| b.in_flight.len()),
            seeders: transfer.seeders.len(),
            has_metadata: book.is_some(),
        })
    }

    pub fn downloads(&self) -> Vec<DownloadStatus> {
        let mut all: Vec<DownloadStatus> = self
            .incoming
            .keys()
            .filter_map(|id| self.download_status(id))
            .collect();
        all.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        all
    }

    pub fn piece_status(&self, file_id: &FileId, piece_index: u32) -> Option<PieceStatus> {
        let book = self.incoming.get(file_id)?.book.as_ref()?;
        book.status.get(piece_index as usize).copied()
    }

    /// Seeder currently asked for `piece_index`, if it is in flight.
    pub fn requested_from(&self, file_id: &FileId, piece_index: u32) -> Option<&PeerId> {
        self.incoming
            .get(file_id)?
            .book
            .as_ref()?
            .in_flight
            .get(&piece_index)
    }

    pub fn in_flight(&self, file_id: &FileId) -> usize {
        self.incoming
            .get(file_id)
            .and_then(|t| t.book.as_ref())
            .map_or(0, |b| b.in_flight.len())
    }

    pub fn is_seeding(&self, file_id: &FileId) -> bool {
        self.outgoing.contains_key(file_id)
    }

    pub fn seeding(&self) -> Vec<FileAnnouncement> {
        self.outgoing
            .values()
            .map(|o| o.metadata.announcement())
            .collect()
    }

    pub fn known_file(&self, file_id: &FileId) -> Option<&FileAnnouncement> {
        self.known.get(file_id)
    }
}

/// BLAKE3 hash of every piece of `data`.
pub fn hash_pieces(data: &[u8], piece_size: usize) -> Vec<PieceHash> {
    data.chunks(piece_size.max(1)).map(PieceHash::of).collect()
}

/// Size and piece hashes of a file on disk, read one piece at a time.
fn hash_file(path: &Path, piece_size: usize) -> std::io::Result<(u64, Vec<PieceHash>)> {
    let mut file = std::fs::File::open(path)?;
    let mut hashes = Vec::new();
    let mut total = 0u64;
    let mut buf = Vec::with_capacity(piece_size);

    loop {
        buf.clear();
        let n = (&mut file).take(piece_size as u64).read_to_end(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hashes.push(PieceHash::of(&buf));
        if n < piece_size {
            break;
        }
    }
    Ok((total, hashes))
}

fn guess_file_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests;
