//! Per-session state shared by every protocol component.

use std::sync::Arc;

use tokio::sync::mpsc;

use skiff_net::{publish_packet, subscribe_channel, NetError, TransportCommand};
use skiff_shared::protocol::{Channel, WireMessage};
use skiff_shared::types::PeerId;
use skiff_shared::TransferConfig;
use skiff_store::PieceStore;

use crate::events::{emit_event, ClientEvent};
use crate::secure_channel::RoomContext;

/// Identity, room, configuration and outbound channels of one session.
///
/// Owned by the session task and lent to each component per event; there is
/// no other copy of this state.
pub struct SessionContext {
    pub local_id: PeerId,
    pub room: RoomContext,
    pub config: TransferConfig,
    /// `None` when no piece store could be opened; downloads then stream.
    pub store: Option<Arc<dyn PieceStore>>,
    cmd_tx: mpsc::Sender<TransportCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl SessionContext {
    pub fn new(
        local_id: PeerId,
        room: RoomContext,
        config: TransferConfig,
        store: Option<Arc<dyn PieceStore>>,
        cmd_tx: mpsc::Sender<TransportCommand>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            local_id,
            room,
            config,
            store,
            cmd_tx,
            events,
        }
    }

    /// Publish `message` into the current room.
    pub async fn publish(&self, message: WireMessage) -> Result<(), NetError> {
        publish_packet(&self.cmd_tx, &self.room.room_id, message).await
    }

    /// Subscribe to every channel the client uses.
    pub async fn subscribe_all(&self) -> Result<(), NetError> {
        for channel in Channel::ALL {
            subscribe_channel(&self.cmd_tx, channel).await?;
        }
        Ok(())
    }

    /// Tell the transport we are leaving. Errors mean it is already gone.
    pub async fn detach(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Shutdown).await;
    }

    pub fn emit(&self, event: ClientEvent) {
        emit_event(&self.events, event);
    }
}
