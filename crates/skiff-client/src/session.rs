//! The session task.
//!
//! One task owns all protocol state for a peer and processes application
//! commands, inbound transport messages, fired timers and periodic ticks
//! one at a time. The application talks to it through a [`SessionHandle`]
//! and observes it through a stream of [`ClientEvent`]s.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use skiff_net::{
    decode_packet, now_millis, ActiveMembers, InboundMessage, RoomDirectory, RoomSummary,
    TransportCommand,
};
use skiff_shared::protocol::{
    Channel, ChatPayload, Envelope, FileAnnouncement, HistoryEntry, HistorySnapshot, WireMessage,
};
use skiff_shared::types::{EpochId, FileId, PeerId, RoomId, SecurityModeKind};
use skiff_shared::TransferConfig;
use skiff_store::PieceStore;

use crate::context::SessionContext;
use crate::epoch::{EpochKeyManager, EpochState, RekeyOutcome};
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::history::ChatHistory;
use crate::metadata::MetadataDistribution;
use crate::secure_channel::{RoomContext, SecureChannel, SecurityMode};
use crate::timers::{TimerEvent, Timers};
use crate::transfer::{DownloadStatus, TransferEngine};

const COMMAND_QUEUE: usize = 64;

/// Requests from the application to the session task.
#[derive(Debug)]
pub enum SessionCommand {
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ShareFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<FileAnnouncement>>,
    },
    ShareBytes {
        file_name: String,
        file_type: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<FileAnnouncement>>,
    },
    Download {
        file_id: FileId,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelDownload {
        file_id: FileId,
        reply: oneshot::Sender<Result<()>>,
    },
    SwitchRoom {
        room_id: RoomId,
        mode: SecurityMode,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestRekey {
        reply: oneshot::Sender<Result<()>>,
    },
    Status(oneshot::Sender<SessionStatus>),
    Rooms(oneshot::Sender<Vec<RoomSummary>>),
    Shutdown,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub local_id: PeerId,
    pub room_id: RoomId,
    pub mode: SecurityModeKind,
    pub epoch_id: Option<EpochId>,
    pub epoch_state: EpochState,
    pub members: Vec<PeerId>,
    pub coordinator: Option<PeerId>,
    pub downloads: Vec<DownloadStatus>,
    pub seeding: Vec<FileAnnouncement>,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    local_id: PeerId,
}

impl SessionHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ClientError::NotInRoom)?;
        rx.await.map_err(|_| ClientError::NotInRoom)?
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendChat { text, reply })
            .await
    }

    /// Seed a file on disk and announce it.
    pub async fn share_file(&self, path: impl Into<PathBuf>) -> Result<FileAnnouncement> {
        let path = path.into();
        self.request(|reply| SessionCommand::ShareFile { path, reply })
            .await
    }

    /// Seed an in-memory buffer and announce it.
    pub async fn share_bytes(
        &self,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<FileAnnouncement> {
        let (file_name, file_type) = (file_name.into(), file_type.into());
        self.request(|reply| SessionCommand::ShareBytes {
            file_name,
            file_type,
            data,
            reply,
        })
        .await
    }

    pub async fn download(&self, file_id: FileId) -> Result<()> {
        self.request(|reply| SessionCommand::Download { file_id, reply })
            .await
    }

    pub async fn cancel_download(&self, file_id: FileId) -> Result<()> {
        self.request(|reply| SessionCommand::CancelDownload { file_id, reply })
            .await
    }

    /// Leave the current room and enter `room_id`.
    pub async fn switch_room(&self, room_id: RoomId, mode: SecurityMode) -> Result<()> {
        self.request(|reply| SessionCommand::SwitchRoom {
            room_id,
            mode,
            reply,
        })
        .await
    }

    /// Rotate now if we coordinate, otherwise ask the coordinator to.
    pub async fn request_rekey(&self) -> Result<()> {
        self.request(|reply| SessionCommand::RequestRekey { reply })
            .await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Status(reply))
            .await
            .map_err(|_| ClientError::NotInRoom)?;
        rx.await.map_err(|_| ClientError::NotInRoom)
    }

    /// Rooms seen on the presence channel, busiest first.
    pub async fn rooms(&self) -> Result<Vec<RoomSummary>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Rooms(reply))
            .await
            .map_err(|_| ClientError::NotInRoom)?;
        rx.await.map_err(|_| ClientError::NotInRoom)
    }

    /// Stop the session task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
    }
}

/// Start a session for `local_id` in `room_id` on top of a transport
/// connection.
///
/// Must be called from within a tokio runtime. `store` is used to assemble
/// small downloads; without one every download streams to disk.
pub fn spawn_session(
    local_id: PeerId,
    room_id: RoomId,
    mode: SecurityMode,
    config: TransferConfig,
    store: Option<Arc<dyn PieceStore>>,
    transport_tx: mpsc::Sender<TransportCommand>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
) -> (SessionHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (timers, timer_rx) = Timers::new();

    let mut members = ActiveMembers::new();
    members.touch(&local_id, now_millis());
    let history = ChatHistory::new(config.history_limit);

    let ctx = SessionContext::new(
        local_id.clone(),
        RoomContext::new(room_id, mode),
        config,
        store,
        transport_tx,
        event_tx,
    );

    let session = Session {
        ctx,
        channel: SecureChannel::new(),
        epochs: EpochKeyManager::new(local_id.clone()),
        transfers: TransferEngine::new(),
        metadata: MetadataDistribution::new(),
        members,
        rooms: RoomDirectory::new(),
        history,
        timers,
    };
    tokio::spawn(session.run(cmd_rx, inbound_rx, timer_rx));

    (
        SessionHandle {
            tx: cmd_tx,
            local_id,
        },
        event_rx,
    )
}

struct Session {
    ctx: SessionContext,
    channel: SecureChannel,
    epochs: EpochKeyManager,
    transfers: TransferEngine,
    metadata: MetadataDistribution,
    members: ActiveMembers,
    rooms: RoomDirectory,
    history: ChatHistory,
    timers: Timers,
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        if let Err(e) = self.ctx.subscribe_all().await {
            warn!(error = %e, "Subscribing failed, transport is gone");
            return;
        }
        info!(
            peer = %self.ctx.local_id,
            room = %self.ctx.room.room_id,
            mode = ?self.ctx.room.mode,
            "Session started"
        );
        self.enter_room().await;

        let mut presence = ticker(self.ctx.config.presence_interval);
        let mut rekey = ticker(self.ctx.config.rekey_interval);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) => {
                            info!("Session shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("All session handles dropped, shutting down");
                            break;
                        }
                    }
                }

                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle_inbound(msg).await,
                        None => {
                            warn!("Transport closed, shutting down session");
                            break;
                        }
                    }
                }

                Some(event) = timer_rx.recv() => {
                    if self.timers.fire(&event) {
                        self.transfers
                            .handle_timer(&self.ctx, &mut self.timers, &mut self.metadata, event.kind)
                            .await;
                    }
                }

                _ = presence.tick() => self.presence_tick().await,

                _ = rekey.tick() => self.rekey().await,
            }
        }

        self.timers.cancel_all();
        self.ctx.detach().await;
        info!(peer = %self.ctx.local_id, "Session stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendChat { text, reply } => {
                let _ = reply.send(self.send_chat(text).await);
            }
            SessionCommand::ShareFile { path, reply } => {
                let result = self
                    .transfers
                    .share_file(&self.ctx, &mut self.channel, &path)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::ShareBytes {
                file_name,
                file_type,
                data,
                reply,
            } => {
                let result = self
                    .transfers
                    .share_bytes(&self.ctx, &mut self.channel, file_name, file_type, data)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::Download { file_id, reply } => {
                let result = self
                    .transfers
                    .start_download(&self.ctx, &mut self.timers, file_id)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::CancelDownload { file_id, reply } => {
                let result = self
                    .transfers
                    .cancel_download(&mut self.timers, &mut self.metadata, file_id)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::SwitchRoom {
                room_id,
                mode,
                reply,
            } => {
                self.switch_room(room_id, mode).await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::RequestRekey { reply } => {
                let _ = reply.send(self.request_rekey().await);
            }
            SessionCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            SessionCommand::Rooms(reply) => {
                let _ = reply.send(self.rooms.summaries());
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn send_chat(&mut self, text: String) -> Result<()> {
        let payload = ChatPayload::Text(text.clone()).to_bytes()?;
        let envelope = self.channel.seal(&payload, &self.ctx.room).await?;
        self.ctx.publish(WireMessage::Chat(envelope)).await?;
        if self.keeps_history() {
            self.history.record(HistoryEntry {
                sender: self.ctx.local_id.clone(),
                timestamp: now_millis(),
                text,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Per-room startup: derive the password key or create the epoch
    /// keypair, then make ourselves known.
    async fn enter_room(&mut self) {
        if let Err(e) = self.channel.prime(&self.ctx.room).await {
            warn!(room = %self.ctx.room.room_id, error = %e, "Could not derive room key");
        }

        if self.ctx.room.mode == SecurityMode::ForwardSecure {
            self.epochs.enter_room();
            // Alone so far: we coordinate and key the room ourselves
            self.rekey().await;
            if let Some(announcement) = self.epochs.announcement(&self.ctx.room) {
                self.publish(announcement).await;
            }
        }

        self.publish_presence().await;
    }

    async fn switch_room(&mut self, room_id: RoomId, mode: SecurityMode) {
        info!(from = %self.ctx.room.room_id, to = %room_id, mode = ?mode, "Switching room");

        self.transfers
            .reset_room(&mut self.timers, &mut self.metadata)
            .await;
        self.epochs.leave_room();
        self.ctx.room.clear_epoch_key();

        self.members.clear();
        self.members.touch(&self.ctx.local_id, now_millis());
        self.history.clear();
        self.rooms.leave(&self.ctx.room.room_id, &self.ctx.local_id);
        self.ctx.room = RoomContext::new(room_id, mode);

        self.enter_room().await;
        self.emit_members();
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, msg: InboundMessage) {
        let Some(packet) = decode_packet(&msg) else {
            return;
        };
        let sender = msg.sender;
        if sender == self.ctx.local_id {
            return;
        }

        if let WireMessage::Presence { protected } = packet.message {
            self.observe_room(&packet.room_id, &sender, protected, msg.timestamp);
        }
        if packet.room_id != self.ctx.room.room_id {
            return;
        }

        if self.members.touch(&sender, msg.timestamp) {
            info!(peer = %sender, members = self.members.len(), "Member joined");
            self.emit_members();
            // Our key may have been announced before they arrived
            if !self.epochs.directory().contains(&sender) {
                if let Some(announcement) = self.epochs.announcement(&self.ctx.room) {
                    self.publish(announcement).await;
                }
            }
            self.publish_history().await;
        }

        match packet.message {
            WireMessage::Presence { .. } => {}
            WireMessage::History(envelope) => self.handle_history(&sender, &envelope).await,
            WireMessage::Chat(envelope) => self.handle_chat(&sender, msg.timestamp, &envelope).await,
            WireMessage::SourceRequest { file_id } => {
                self.transfers
                    .handle_source_request(&self.ctx, &sender, file_id)
                    .await;
            }
            WireMessage::SourceAnnounce { file_id } => {
                self.transfers
                    .handle_source_announce(
                        &self.ctx,
                        &mut self.timers,
                        &mut self.metadata,
                        &sender,
                        file_id,
                    )
                    .await;
            }
            WireMessage::MetadataRequest { file_id } => {
                self.transfers
                    .handle_metadata_request(&self.ctx, &sender, file_id)
                    .await;
            }
            WireMessage::MetadataPiece(chunk) => {
                self.transfers
                    .handle_metadata_chunk(&self.ctx, &mut self.timers, &mut self.metadata, chunk)
                    .await;
            }
            WireMessage::PieceRequest {
                file_id,
                piece_index,
                target_seeder,
            } => {
                let served = self
                    .transfers
                    .handle_piece_request(
                        &self.ctx,
                        &mut self.channel,
                        &sender,
                        file_id,
                        piece_index,
                        &target_seeder,
                    )
                    .await;
                if let Err(e) = served {
                    debug!(file_id = %file_id, piece = piece_index, peer = %sender, error = %e, "Could not serve piece");
                }
            }
            WireMessage::FilePiece {
                file_id,
                piece_index,
                envelope,
            } => {
                self.transfers
                    .handle_file_piece(
                        &self.ctx,
                        &mut self.channel,
                        &mut self.timers,
                        &sender,
                        file_id,
                        piece_index,
                        &envelope,
                    )
                    .await;
            }
            WireMessage::PublicKeyAnnounce {
                public_key,
                held_epoch,
            } => {
                let outcome = self.epochs.handle_public_key_announce(
                    &self.ctx.room,
                    &sender,
                    &public_key,
                    held_epoch,
                    now_millis(),
                );
                if let Some(reply) = outcome.reciprocate {
                    self.publish(reply).await;
                }
                if outcome.newly_known {
                    self.rekey().await;
                }
            }
            WireMessage::EpochKeyDistribution {
                epoch_id,
                recipient,
                sealed,
            } => {
                let adopted = self.epochs.handle_distribution(
                    &mut self.ctx.room,
                    &sender,
                    epoch_id,
                    &recipient,
                    &sealed,
                );
                if let Some(epoch_id) = adopted {
                    info!(epoch_id = %epoch_id, from = %sender, "Adopted epoch key");
                    self.ctx.emit(ClientEvent::EpochKeyAdopted {
                        epoch_id,
                        from: sender,
                    });
                }
            }
            WireMessage::RekeyRequest => {
                debug!(peer = %sender, "Rekey requested");
                self.rekey().await;
            }
        }
    }

    async fn handle_chat(&mut self, sender: &PeerId, timestamp: u64, envelope: &Envelope) {
        let opened = self
            .channel
            .open(envelope, &self.ctx.room)
            .await
            .and_then(|bytes| ChatPayload::from_bytes(&bytes).map_err(ClientError::from));

        match opened {
            Ok(ChatPayload::Text(text)) => {
                if self.keeps_history() {
                    self.history.record(HistoryEntry {
                        sender: sender.clone(),
                        timestamp,
                        text: text.clone(),
                    });
                }
                self.ctx.emit(ClientEvent::ChatReceived {
                    sender: sender.clone(),
                    text,
                    timestamp,
                });
            }
            Ok(ChatPayload::FileAnnounce(announcement)) => {
                self.transfers
                    .register_announcement(&self.ctx, sender, announcement);
            }
            Err(e) => {
                debug!(peer = %sender, error = %e, "Undecryptable chat message");
                self.ctx.emit(ClientEvent::Undecryptable {
                    sender: sender.clone(),
                    channel: Channel::Chat,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    async fn presence_tick(&mut self) {
        self.publish_presence().await;

        let timeout_ms = self.ctx.config.online_timeout.as_millis() as u64;
        self.rooms
            .prune(now_millis(), timeout_ms.saturating_mul(2));
        if self.history.is_dirty() {
            self.publish_history().await;
        }

        let gone = self
            .members
            .prune(now_millis(), timeout_ms, &self.ctx.local_id);
        if gone.is_empty() {
            return;
        }

        for peer in &gone {
            info!(peer = %peer, "Member timed out");
            self.epochs.forget_peer(peer);
        }
        self.emit_members();
        // Departed members must not receive the next epoch
        self.rekey().await;
    }

    /// Rotate the epoch key if we are the coordinator of a forward-secure
    /// room.
    async fn rekey(&mut self) {
        let outcome = self
            .epochs
            .rekey(&mut self.ctx.room, &self.members, now_millis());
        match outcome {
            RekeyOutcome::Rotated {
                epoch_id,
                distributions,
                ..
            } => {
                for distribution in distributions {
                    self.publish(distribution).await;
                }
                self.ctx.emit(ClientEvent::EpochKeyAdopted {
                    epoch_id,
                    from: self.ctx.local_id.clone(),
                });
            }
            RekeyOutcome::NotCoordinator(coordinator) => {
                debug!(coordinator = %coordinator, "Not coordinating, skipping rekey");
            }
            RekeyOutcome::Stalled(held) => {
                warn!(epoch_id = %held, "Epoch key rotation stalled");
            }
            RekeyOutcome::Inactive => {}
        }
    }

    async fn request_rekey(&mut self) -> Result<()> {
        if self.ctx.room.mode != SecurityMode::ForwardSecure {
            return Ok(());
        }
        match self.members.coordinator() {
            Some(coordinator) if coordinator != &self.ctx.local_id => {
                self.ctx.publish(WireMessage::RekeyRequest).await?;
            }
            _ => self.rekey().await,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence and history
    // ------------------------------------------------------------------

    async fn publish_presence(&mut self) {
        let protected = self.ctx.room.mode.kind() != SecurityModeKind::Open;
        self.publish(WireMessage::Presence { protected }).await;
        let (room_id, local_id) = (self.ctx.room.room_id.clone(), self.ctx.local_id.clone());
        self.rooms
            .observe(&room_id, &local_id, protected, now_millis());
    }

    fn observe_room(&mut self, room_id: &RoomId, peer: &PeerId, protected: bool, timestamp: u64) {
        if self.rooms.observe(room_id, peer, protected, timestamp)
            && room_id != &self.ctx.room.room_id
        {
            info!(room = %room_id, protected, "Discovered room");
            self.ctx.emit(ClientEvent::RoomDiscovered {
                room_id: room_id.clone(),
                protected,
            });
        }
    }

    /// Forward-secure rooms keep no history.
    fn keeps_history(&self) -> bool {
        self.ctx.room.mode != SecurityMode::ForwardSecure
    }

    /// Publish our recent chat lines, sealed like chat.
    async fn publish_history(&mut self) {
        if !self.keeps_history() {
            return;
        }
        let Some(snapshot) = self.history.snapshot() else {
            return;
        };
        let sealed = match snapshot.to_bytes() {
            Ok(bytes) => self.channel.seal(&bytes, &self.ctx.room).await,
            Err(e) => Err(e.into()),
        };
        match sealed {
            Ok(envelope) => self.publish(WireMessage::History(envelope)).await,
            Err(e) => warn!(error = %e, "Could not seal chat history"),
        }
    }

    async fn handle_history(&mut self, sender: &PeerId, envelope: &Envelope) {
        if !self.keeps_history() {
            debug!(peer = %sender, "Ignoring history in a forward-secure room");
            return;
        }
        let snapshot = self
            .channel
            .open(envelope, &self.ctx.room)
            .await
            .and_then(|bytes| HistorySnapshot::from_bytes(&bytes).map_err(ClientError::from));
        let snapshot = match snapshot {
            Ok(s) => s,
            Err(e) => {
                debug!(peer = %sender, error = %e, "Unreadable chat history");
                return;
            }
        };

        let messages = self.history.merge(snapshot);
        if !messages.is_empty() {
            self.ctx.emit(ClientEvent::HistoryReceived {
                from: sender.clone(),
                messages,
            });
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            local_id: self.ctx.local_id.clone(),
            room_id: self.ctx.room.room_id.clone(),
            mode: self.ctx.room.mode.kind(),
            epoch_id: self.ctx.room.current_epoch(),
            epoch_state: self.epochs.state(),
            members: self.members.peers(),
            coordinator: self.members.coordinator().cloned(),
            downloads: self.transfers.downloads(),
            seeding: self.transfers.seeding(),
        }
    }

    fn emit_members(&self) {
        self.ctx.emit(ClientEvent::MembersChanged {
            members: self.members.peers(),
        });
    }

    /// Best-effort publish; a failure only means the message is lost.
    async fn publish(&self, message: WireMessage) {
        if let Err(e) = self.ctx.publish(message).await {
            warn!(error = %e, "Publish failed");
        }
    }
}
