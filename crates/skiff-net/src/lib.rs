// Transport interface over a best-effort publish/subscribe channel.

pub mod bus;
pub mod error;
pub mod members;
pub mod messages;
pub mod rooms;
pub mod transport;

pub use bus::{DeliveryFilter, MemoryBus};
pub use error::NetError;
pub use members::ActiveMembers;
pub use messages::{decode_inbound, decode_packet, publish_packet, subscribe_channel};
pub use rooms::{RoomDirectory, RoomSummary};
pub use transport::{now_millis, InboundMessage, TransportCommand};
