use super::*;

use tokio::sync::mpsc;

use skiff_net::TransportCommand;
use skiff_shared::protocol::Packet;
use skiff_shared::types::RoomId;
use skiff_shared::TransferConfig;
use skiff_store::{MemoryPieceStore, PieceStore};

use crate::secure_channel::{RoomContext, SecurityMode};
use crate::timers::TimerEvent;

const PIECE: usize = 16;

struct Harness {
    ctx: SessionContext,
    engine: TransferEngine,
    channel: SecureChannel,
    timers: Timers,
    _timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    metadata: MetadataDistribution,
    wire: mpsc::Receiver<TransportCommand>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

fn config() -> TransferConfig {
    TransferConfig {
        piece_size: PIECE,
        max_concurrent_requests: 8,
        ..TransferConfig::default()
    }
}

fn harness_as(local: &str, config: TransferConfig) -> Harness {
    let (cmd_tx, wire) = mpsc::channel(4096);
    let (event_tx, events) = mpsc::unbounded_channel();
    let store: Arc<dyn PieceStore> = Arc::new(MemoryPieceStore::new());
    let ctx = SessionContext::new(
        PeerId::new(local),
        RoomContext::new(RoomId::new("lobby"), SecurityMode::Open),
        config,
        Some(store),
        cmd_tx,
        event_tx,
    );
    let (timers, timer_rx) = Timers::new();
    Harness {
        ctx,
        engine: TransferEngine::new(),
        channel: SecureChannel::new(),
        timers,
        _timer_rx: timer_rx,
        metadata: MetadataDistribution::new(),
        wire,
        events,
    }
}

fn harness(config: TransferConfig) -> Harness {
    harness_as("leecher", config)
}

fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

impl Harness {
    /// Everything published since the last call.
    fn sent(&mut self) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.wire.try_recv() {
            if let TransportCommand::Publish { data, .. } = cmd {
                out.push(Packet::from_bytes(&data).unwrap().message);
            }
        }
        out
    }

    fn piece_requests(&mut self) -> Vec<(u32, PeerId)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::PieceRequest {
                    piece_index,
                    target_seeder,
                    ..
                } => Some((piece_index, target_seeder)),
                _ => None,
            })
            .collect()
    }

    fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            out.push(e);
        }
        out
    }

    fn announce(&mut self, data: &[u8]) -> (FileAnnouncement, Vec<PieceHash>) {
        let hashes = hash_pieces(data, PIECE);
        let announcement = FileAnnouncement {
            file_id: FileId::new(),
            file_name: "blob.bin".into(),
            file_size: data.len() as u64,
            file_type: "application/octet-stream".into(),
            piece_count: hashes.len() as u32,
        };
        self.engine
            .register_announcement(&self.ctx, &PeerId::new("announcer"), announcement.clone());
        (announcement, hashes)
    }

    async fn add_seeder(&mut self, file_id: FileId, seeder: &str) {
        self.engine
            .handle_source_announce(
                &self.ctx,
                &mut self.timers,
                &mut self.metadata,
                &PeerId::new(seeder),
                file_id,
            )
            .await;
    }

    async fn deliver_metadata(&mut self, announcement: &FileAnnouncement, hashes: Vec<PieceHash>) {
        let metadata = FileMetadata {
            file_id: announcement.file_id,
            file_name: announcement.file_name.clone(),
            file_size: announcement.file_size,
            file_type: announcement.file_type.clone(),
            piece_hashes: hashes,
        };
        for message in split_into_chunks(&metadata, 500) {
            if let WireMessage::MetadataPiece(chunk) = message {
                self.engine
                    .handle_metadata_chunk(&self.ctx, &mut self.timers, &mut self.metadata, chunk)
                    .await;
            }
        }
    }

    /// Announce `data`, discover `seeders` and collect the hash list.
    async fn downloading(&mut self, data: &[u8], seeders: &[&str]) -> FileId {
        let (announcement, hashes) = self.announce(data);
        let file_id = announcement.file_id;
        self.engine
            .start_download(&self.ctx, &mut self.timers, file_id)
            .await
            .unwrap();
        for seeder in seeders {
            self.add_seeder(file_id, seeder).await;
        }
        self.deliver_metadata(&announcement, hashes).await;
        file_id
    }

    async fn time_out(&mut self, file_id: FileId, piece_index: u32) {
        self.engine
            .handle_timer(
                &self.ctx,
                &mut self.timers,
                &mut self.metadata,
                TimerKind::PieceTimeout {
                    file_id,
                    piece_index,
                },
            )
            .await;
    }

    async fn deliver(&mut self, file_id: FileId, piece_index: u32, bytes: &[u8]) {
        let from = self
            .engine
            .requested_from(&file_id, piece_index)
            .cloned()
            .unwrap_or_else(|| PeerId::new("stranger"));
        self.engine
            .handle_file_piece(
                &self.ctx,
                &mut self.channel,
                &mut self.timers,
                &from,
                file_id,
                piece_index,
                &Envelope::Open(bytes.to_vec()),
            )
            .await;
    }
}

fn slice(data: &[u8], index: u32) -> &[u8] {
    let start = index as usize * PIECE;
    &data[start..(start + PIECE).min(data.len())]
}

#[tokio::test]
async fn test_in_flight_never_exceeds_cap() {
    let mut h = harness(config());
    let data = file_bytes(100 * PIECE);
    let file_id = h.downloading(&data, &["s1", "s2"]).await;

    let first: Vec<u32> = h.piece_requests().into_iter().map(|(i, _)| i).collect();
    assert_eq!(first, (0..8).collect::<Vec<u32>>());
    assert_eq!(h.engine.in_flight(&file_id), 8);

    // Nothing frees up, nothing more goes out
    let extra = h
        .engine
        .manage_download(&h.ctx, &mut h.timers, file_id)
        .await
        .unwrap();
    assert_eq!(extra, 0);

    // No response ever arrives: every request times out, repeatedly
    for _round in 0..12 {
        for index in 0..100u32 {
            if h.engine.requested_from(&file_id, index).is_some() {
                h.time_out(file_id, index).await;
                assert!(h.engine.in_flight(&file_id) <= 8);
            }
        }
    }

    assert_eq!(h.engine.in_flight(&file_id), 8);
    let later = h.piece_requests();
    assert!(later.iter().all(|(i, _)| *i < 8));
    assert_eq!(h.engine.piece_status(&file_id, 99), Some(PieceStatus::Pending));
}

#[tokio::test]
async fn test_timed_out_piece_goes_to_another_seeder() {
    let mut h = harness(config());
    let data = file_bytes(PIECE);
    let file_id = h.downloading(&data, &["seeder-a", "seeder-b"]).await;

    let first = h.engine.requested_from(&file_id, 0).cloned().unwrap();
    h.time_out(file_id, 0).await;

    assert_eq!(h.engine.piece_status(&file_id, 0), Some(PieceStatus::Requested));
    let second = h.engine.requested_from(&file_id, 0).cloned().unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_three_piece_download_with_one_retry() {
    let mut h = harness(config());
    let data = file_bytes(2 * PIECE + PIECE / 2);
    let file_id = h.downloading(&data, &["seeder"]).await;
    assert_eq!(h.piece_requests().len(), 3);

    h.deliver(file_id, 0, slice(&data, 0)).await;
    h.time_out(file_id, 1).await;
    let retried = h.piece_requests();
    assert_eq!(retried, vec![(1, PeerId::new("seeder"))]);

    h.deliver(file_id, 2, slice(&data, 2)).await;
    h.deliver(file_id, 1, slice(&data, 1)).await;

    let events = h.drain_events();
    let last_progress = events.iter().rev().find_map(|e| match e {
        ClientEvent::DownloadProgress {
            received, total, ..
        } => Some((*received, *total)),
        _ => None,
    });
    assert_eq!(last_progress, Some((3, 3)));

    let artifact = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::DownloadComplete { artifact, .. } => Some(artifact.clone()),
            _ => None,
        })
        .expect("download should complete");
    assert_eq!(artifact.read().await.unwrap(), data);

    assert!(h.engine.is_seeding(&file_id));
    assert!(h.engine.download_status(&file_id).is_none());
}

#[tokio::test]
async fn test_empty_file_completes_on_metadata() {
    let mut h = harness(config());
    let file_id = h.downloading(&[], &["seeder"]).await;
    assert!(h.piece_requests().is_empty());

    let artifact = h
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            ClientEvent::DownloadComplete { artifact, .. } => Some(artifact),
            _ => None,
        })
        .expect("empty download should complete");
    assert!(artifact.read().await.unwrap().is_empty());
    assert!(h.engine.is_seeding(&file_id));
}

#[tokio::test]
async fn test_corrupted_piece_is_rescheduled() {
    let mut h = harness(config());
    let data = file_bytes(2 * PIECE);
    let file_id = h.downloading(&data, &["seeder"]).await;
    h.piece_requests();

    let mut bad = slice(&data, 0).to_vec();
    bad[3] ^= 0x10;
    h.deliver(file_id, 0, &bad).await;

    // Reverted and immediately re-requested
    assert_eq!(h.piece_requests(), vec![(0, PeerId::new("seeder"))]);
    assert_eq!(h.engine.download_status(&file_id).unwrap().received, 0);

    h.deliver(file_id, 0, slice(&data, 0)).await;
    assert_eq!(h.engine.piece_status(&file_id, 0), Some(PieceStatus::Done));
}

#[tokio::test]
async fn test_unauthenticated_piece_is_rescheduled() {
    let mut h = harness(config());
    h.ctx.room = RoomContext::new(RoomId::new("lobby"), SecurityMode::ForwardSecure);
    h.ctx
        .room
        .adopt_epoch_key(crate::epoch::EpochKey::generate(skiff_shared::EpochId(9)));
    let data = file_bytes(PIECE);
    let file_id = h.downloading(&data, &["seeder"]).await;
    h.piece_requests();

    // Plaintext in a forward-secure room is never accepted
    h.deliver(file_id, 0, slice(&data, 0)).await;
    assert_eq!(h.piece_requests().len(), 1);
    assert_eq!(h.engine.download_status(&file_id).unwrap().received, 0);
}

#[tokio::test]
async fn test_unrequested_piece_ignored() {
    let mut h = harness(config());
    let data = file_bytes(20 * PIECE);
    let file_id = h.downloading(&data, &["seeder"]).await;

    h.deliver(file_id, 15, slice(&data, 15)).await;
    assert_eq!(h.engine.piece_status(&file_id, 15), Some(PieceStatus::Pending));
}

#[tokio::test]
async fn test_late_piece_after_cancel_is_dropped() {
    let mut h = harness(config());
    let data = file_bytes(3 * PIECE);
    let file_id = h.downloading(&data, &["seeder"]).await;

    h.engine
        .cancel_download(&mut h.timers, &mut h.metadata, file_id)
        .await
        .unwrap();
    assert_eq!(h.timers.armed(), 0);
    h.drain_events();

    h.deliver(file_id, 0, slice(&data, 0)).await;
    assert!(h.drain_events().is_empty());
    assert!(h.engine.download_status(&file_id).is_none());

    let again = h
        .engine
        .cancel_download(&mut h.timers, &mut h.metadata, file_id)
        .await;
    assert!(matches!(again, Err(ClientError::UnknownFile(_))));
}

#[tokio::test]
async fn test_no_seeders_rebroadcasts_discovery() {
    let mut h = harness(config());
    let (announcement, _) = h.announce(&file_bytes(PIECE));
    let file_id = announcement.file_id;

    h.engine
        .start_download(&h.ctx, &mut h.timers, file_id)
        .await
        .unwrap();
    assert!(h
        .timers
        .is_armed(&TimerKind::DownloadRetry { file_id }));

    h.engine
        .handle_timer(
            &h.ctx,
            &mut h.timers,
            &mut h.metadata,
            TimerKind::DownloadRetry { file_id },
        )
        .await;

    let requests = h
        .sent()
        .into_iter()
        .filter(|m| matches!(m, WireMessage::SourceRequest { .. }))
        .count();
    assert_eq!(requests, 2);
}

#[tokio::test]
async fn test_unknown_file_cannot_be_downloaded() {
    let mut h = harness(config());
    let result = h
        .engine
        .start_download(&h.ctx, &mut h.timers, FileId::new())
        .await;
    assert!(matches!(result, Err(ClientError::UnknownFile(_))));
}

#[tokio::test]
async fn test_announcement_with_overflowing_piece_count_is_ignored() {
    let mut h = harness(config());
    let announcement = FileAnnouncement {
        file_id: FileId::new(),
        file_name: "huge.bin".into(),
        file_size: (1u64 << 32) * PIECE as u64 + 1,
        file_type: String::new(),
        piece_count: 1,
    };
    let file_id = announcement.file_id;
    h.engine
        .register_announcement(&h.ctx, &PeerId::new("announcer"), announcement);

    assert!(h.engine.known_file(&file_id).is_none());
    assert!(h.drain_events().is_empty());
    let result = h
        .engine
        .start_download(&h.ctx, &mut h.timers, file_id)
        .await;
    assert!(matches!(result, Err(ClientError::UnknownFile(_))));
}

#[tokio::test]
async fn test_announcement_with_wrong_piece_count_is_ignored() {
    let mut h = harness(config());
    let announcement = FileAnnouncement {
        file_id: FileId::new(),
        file_name: "short.bin".into(),
        file_size: 3 * PIECE as u64,
        file_type: String::new(),
        piece_count: 2,
    };
    let file_id = announcement.file_id;
    h.engine
        .register_announcement(&h.ctx, &PeerId::new("announcer"), announcement);

    assert!(h.engine.known_file(&file_id).is_none());
}

#[tokio::test]
async fn test_wrong_length_hash_list_is_rerequested() {
    let mut h = harness(config());
    let data = file_bytes(4 * PIECE);
    let (announcement, mut hashes) = h.announce(&data);
    let file_id = announcement.file_id;

    h.engine
        .start_download(&h.ctx, &mut h.timers, file_id)
        .await
        .unwrap();
    h.add_seeder(file_id, "seeder").await;
    h.sent();

    hashes.pop();
    h.deliver_metadata(&announcement, hashes).await;

    assert!(!h.engine.download_status(&file_id).unwrap().has_metadata);
    let sent = h.sent();
    assert!(sent
        .iter()
        .any(|m| matches!(m, WireMessage::MetadataRequest { .. })));
    assert_eq!(h.metadata.attempts(&file_id), 2);
}

#[tokio::test]
async fn test_metadata_gives_up_after_max_attempts() {
    let mut h = harness(TransferConfig {
        metadata_max_attempts: 2,
        ..config()
    });
    let (announcement, _) = h.announce(&file_bytes(PIECE));
    let file_id = announcement.file_id;

    h.engine
        .start_download(&h.ctx, &mut h.timers, file_id)
        .await
        .unwrap();
    h.add_seeder(file_id, "seeder").await;

    for _ in 0..2 {
        h.engine
            .handle_timer(
                &h.ctx,
                &mut h.timers,
                &mut h.metadata,
                TimerKind::MetadataTimeout { file_id },
            )
            .await;
    }

    let failed = h
        .drain_events()
        .into_iter()
        .any(|e| matches!(e, ClientEvent::DownloadFailed { file_id: f, .. } if f == file_id));
    assert!(failed);
    assert!(h.engine.download_status(&file_id).is_none());
    assert!(!h.metadata.is_collecting(&file_id));
}

#[tokio::test]
async fn test_publish_failure_reverts_and_schedules_retry() {
    let mut h = harness(config());
    let data = file_bytes(2 * PIECE);
    let file_id = h.downloading(&data, &["seeder"]).await;
    h.timers.cancel(&TimerKind::DownloadRetry { file_id });

    // Transport goes away
    drop(std::mem::replace(&mut h.wire, mpsc::channel(1).1));

    h.time_out(file_id, 0).await;
    assert_eq!(h.engine.piece_status(&file_id, 0), Some(PieceStatus::Pending));
    assert!(h.timers.is_armed(&TimerKind::DownloadRetry { file_id }));
}

#[tokio::test]
async fn test_seeder_serves_only_addressed_requests() {
    let mut h = harness_as("seeder", config());
    let data = file_bytes(3 * PIECE - 5);
    let announcement = h
        .engine
        .share_bytes(
            &h.ctx,
            &mut h.channel,
            "shared.bin".into(),
            "application/octet-stream".into(),
            data.clone(),
        )
        .await
        .unwrap();
    let file_id = announcement.file_id;
    assert_eq!(announcement.piece_count, 3);

    let announced = h.sent();
    assert!(matches!(announced.as_slice(), [WireMessage::Chat(_)]));

    h.engine
        .handle_piece_request(
            &h.ctx,
            &mut h.channel,
            &PeerId::new("leecher"),
            file_id,
            2,
            &PeerId::new("someone-else"),
        )
        .await
        .unwrap();
    assert!(h.sent().is_empty());

    h.engine
        .handle_piece_request(
            &h.ctx,
            &mut h.channel,
            &PeerId::new("leecher"),
            file_id,
            2,
            &PeerId::new("seeder"),
        )
        .await
        .unwrap();
    match h.sent().as_slice() {
        [WireMessage::FilePiece {
            piece_index: 2,
            envelope: Envelope::Open(bytes),
            ..
        }] => assert_eq!(bytes.as_slice(), slice(&data, 2)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_shared_file_on_disk_serves_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    let data = file_bytes(2 * PIECE + 1);
    std::fs::write(&path, &data).unwrap();

    let mut h = harness_as("seeder", config());
    let announcement = h
        .engine
        .share_file(&h.ctx, &mut h.channel, &path)
        .await
        .unwrap();
    assert_eq!(announcement.file_type, "text/plain");
    assert_eq!(announcement.file_size, data.len() as u64);
    assert_eq!(announcement.piece_count, 3);
    h.sent();

    h.engine
        .handle_metadata_request(&h.ctx, &PeerId::new("leecher"), announcement.file_id)
        .await;
    let chunks = h.sent();
    assert_eq!(chunks.len(), 1);

    h.engine
        .handle_piece_request(
            &h.ctx,
            &mut h.channel,
            &PeerId::new("leecher"),
            announcement.file_id,
            2,
            &PeerId::new("seeder"),
        )
        .await
        .unwrap();
    match h.sent().as_slice() {
        [WireMessage::FilePiece {
            envelope: Envelope::Open(bytes),
            ..
        }] => assert_eq!(bytes.as_slice(), &data[2 * PIECE..]),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_large_file_streams_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(TransferConfig {
        assembly_threshold: 10,
        download_dir: dir.path().to_path_buf(),
        ..config()
    });
    let data = file_bytes(3 * PIECE);
    let file_id = h.downloading(&data, &["seeder"]).await;

    for index in [2u32, 0, 1] {
        h.deliver(file_id, index, slice(&data, index)).await;
    }

    let artifact = h
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            ClientEvent::DownloadComplete { artifact, .. } => Some(artifact),
            _ => None,
        })
        .unwrap();
    assert!(matches!(artifact, Artifact::Disk(_)));
    assert_eq!(artifact.read().await.unwrap(), data);
}
