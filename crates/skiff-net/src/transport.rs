//! Transport command / notification types.
//!
//! The transport runs in its own task. The client talks to it through typed
//! mpsc channels: commands in, inbound messages out. Delivery is best-effort
//! with no ordering guarantee.

use skiff_shared::protocol::Channel;
use skiff_shared::types::PeerId;

/// Commands sent *into* the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Publish a payload on a channel.
    Publish { channel: Channel, data: Vec<u8> },
    /// Subscribe to a channel.
    Subscribe(Channel),
    /// Detach from the transport.
    Shutdown,
}

/// A payload observed on a subscribed channel, with the metadata the
/// transport assigns.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: Channel,
    /// Publisher id as asserted by the transport.
    pub sender: PeerId,
    /// Transport timestamp (Unix epoch millis).
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Current wall-clock time in Unix epoch millis.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
