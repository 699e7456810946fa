//! In-process publish/subscribe bus.
//!
//! Behaves like the shared broadcast transport the client is written
//! against: every publish fans out to the other subscribers of the channel,
//! the sender does not hear its own messages, delivery is best-effort (a full
//! subscriber queue or the configured loss rate drops the message) and the
//! bus stamps each delivery with the publisher id and a timestamp.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use skiff_shared::protocol::Channel;
use skiff_shared::types::PeerId;

use crate::transport::{now_millis, InboundMessage, TransportCommand};

/// Per-peer queue depth.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Delivery predicate: `(from, to, channel, data)`. Returning `false` drops
/// the delivery.
pub type DeliveryFilter = Arc<dyn Fn(&PeerId, &PeerId, Channel, &[u8]) -> bool + Send + Sync>;

struct Subscriber {
    channels: HashSet<Channel>,
    inbox: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<PeerId, Subscriber>,
}

/// Handle to an in-process bus. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    capacity: usize,
    drop_rate: f64,
    filter: Option<DeliveryFilter>,
}

impl MemoryBus {
    /// Create a lossless bus.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            capacity: DEFAULT_QUEUE_CAPACITY,
            drop_rate: 0.0,
            filter: None,
        }
    }

    /// Create a bus that silently drops each delivery with probability `rate`.
    pub fn with_loss(rate: f64) -> Self {
        Self {
            drop_rate: rate.clamp(0.0, 1.0),
            ..Self::new()
        }
    }

    /// Create a lossless bus that consults `filter` before every delivery.
    pub fn with_filter(filter: DeliveryFilter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::new()
        }
    }

    /// Attach a peer subscribed to `channels`.
    ///
    /// Returns `(command_tx, inbound_rx)`. Dropping `command_tx` or sending
    /// [`TransportCommand::Shutdown`] detaches the peer.
    pub fn connect(
        &self,
        peer_id: PeerId,
        channels: &[Channel],
    ) -> (mpsc::Sender<TransportCommand>, mpsc::Receiver<InboundMessage>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCommand>(self.capacity);
        let (inbox_tx, inbox_rx) = mpsc::channel::<InboundMessage>(self.capacity);

        let own_inbox = inbox_tx.clone();
        self.with_state(|state| {
            state.subscribers.insert(
                peer_id.clone(),
                Subscriber {
                    channels: channels.iter().copied().collect(),
                    inbox: inbox_tx,
                },
            );
        });

        info!(peer = %peer_id, "Peer attached to memory bus");

        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::Publish { channel, data } => {
                        bus.deliver(&peer_id, channel, data);
                    }
                    TransportCommand::Subscribe(channel) => {
                        bus.with_state(|state| {
                            if let Some(sub) = state.subscribers.get_mut(&peer_id) {
                                sub.channels.insert(channel);
                            }
                        });
                    }
                    TransportCommand::Shutdown => break,
                }
            }

            // A reconnect under the same id may already have replaced us
            bus.with_state(|state| {
                let ours = state
                    .subscribers
                    .get(&peer_id)
                    .is_some_and(|sub| sub.inbox.same_channel(&own_inbox));
                if ours {
                    state.subscribers.remove(&peer_id);
                }
            });
            info!(peer = %peer_id, "Peer detached from memory bus");
        });

        (cmd_tx, inbox_rx)
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.with_state(|state| state.subscribers.len())
    }

    fn deliver(&self, sender: &PeerId, channel: Channel, data: Vec<u8>) {
        let timestamp = now_millis();
        let drop_rate = self.drop_rate;

        self.with_state(|state| {
            let mut rng = rand::thread_rng();
            for (peer_id, sub) in state.subscribers.iter() {
                if peer_id == sender || !sub.channels.contains(&channel) {
                    continue;
                }
                if drop_rate > 0.0 && rng.gen_bool(drop_rate) {
                    trace!(from = %sender, to = %peer_id, topic = channel.to_topic(), "Dropped by loss model");
                    continue;
                }
                if let Some(filter) = &self.filter {
                    if !filter(sender, peer_id, channel, &data) {
                        trace!(from = %sender, to = %peer_id, topic = channel.to_topic(), "Dropped by filter");
                        continue;
                    }
                }

                let message = InboundMessage {
                    channel,
                    sender: sender.clone(),
                    timestamp,
                    data: data.clone(),
                };
                if sub.inbox.try_send(message).is_err() {
                    debug!(to = %peer_id, topic = channel.to_topic(), "Subscriber queue full or closed, dropping");
                }
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BusState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => {
                warn!("Memory bus lock poisoned, recovering");
                let mut guard = poisoned.into_inner();
                f(&mut guard)
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}
