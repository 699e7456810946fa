use tokio::sync::mpsc;
use tracing::{debug, warn};

use skiff_shared::protocol::{Channel, Packet, WireMessage};
use skiff_shared::types::RoomId;

use crate::error::NetError;
use crate::transport::{InboundMessage, TransportCommand};

/// Serialize `message` for `room_id` and publish it on the message's channel.
pub async fn publish_packet(
    cmd_tx: &mpsc::Sender<TransportCommand>,
    room_id: &RoomId,
    message: WireMessage,
) -> Result<(), NetError> {
    let channel = message.channel();
    let data = Packet::new(room_id.clone(), message).to_bytes()?;

    debug!(
        topic = channel.to_topic(),
        room = %room_id,
        len = data.len(),
        "Publishing packet"
    );

    cmd_tx
        .send(TransportCommand::Publish { channel, data })
        .await
        .map_err(|_| NetError::ChannelClosed)
}

/// Subscribe to `channel` on the transport.
pub async fn subscribe_channel(
    cmd_tx: &mpsc::Sender<TransportCommand>,
    channel: Channel,
) -> Result<(), NetError> {
    cmd_tx
        .send(TransportCommand::Subscribe(channel))
        .await
        .map_err(|_| NetError::ChannelClosed)?;
    debug!(topic = channel.to_topic(), "Subscribed to channel");
    Ok(())
}

/// Decode an inbound message into a packet for `room_id`.
///
/// Returns `None` for undecodable payloads and for packets that belong to
/// another room.
pub fn decode_inbound(inbound: &InboundMessage, room_id: &RoomId) -> Option<Packet> {
    decode_packet(inbound).filter(|packet| &packet.room_id == room_id)
}

/// Decode an inbound message for any room.
pub fn decode_packet(inbound: &InboundMessage) -> Option<Packet> {
    let packet = match Packet::from_bytes(&inbound.data) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                topic = inbound.channel.to_topic(),
                sender = %inbound.sender,
                error = %e,
                "Failed to decode packet"
            );
            return None;
        }
    };

    if packet.message.channel() != inbound.channel {
        warn!(
            topic = inbound.channel.to_topic(),
            sender = %inbound.sender,
            "Packet arrived on the wrong channel"
        );
        return None;
    }

    Some(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_shared::types::PeerId;

    #[tokio::test]
    async fn test_publish_routes_to_message_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let room = RoomId::new("lobby");

        publish_packet(&tx, &room, WireMessage::RekeyRequest).await.unwrap();

        match rx.recv().await {
            Some(TransportCommand::Publish { channel, data }) => {
                assert_eq!(channel, Channel::KeyControl);
                let packet = Packet::from_bytes(&data).unwrap();
                assert_eq!(packet.room_id, room);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_on_closed_channel_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let presence = WireMessage::Presence { protected: false };
        let result = publish_packet(&tx, &RoomId::new("lobby"), presence).await;
        assert!(matches!(result, Err(NetError::ChannelClosed)));
    }

    #[test]
    fn test_decode_filters_other_rooms() {
        let data = Packet::new(
            RoomId::new("elsewhere"),
            WireMessage::Presence { protected: true },
        )
        .to_bytes()
        .unwrap();
        let inbound = InboundMessage {
            channel: Channel::Presence,
            sender: PeerId::new("p1"),
            timestamp: 0,
            data,
        };

        assert!(decode_inbound(&inbound, &RoomId::new("lobby")).is_none());
        assert!(decode_inbound(&inbound, &RoomId::new("elsewhere")).is_some());

        let any = decode_packet(&inbound).unwrap();
        assert_eq!(any.room_id, RoomId::new("elsewhere"));
    }

    #[test]
    fn test_decode_rejects_wrong_channel() {
        let data = Packet::new(RoomId::new("lobby"), WireMessage::RekeyRequest)
            .to_bytes()
            .unwrap();
        let inbound = InboundMessage {
            channel: Channel::Chat,
            sender: PeerId::new("p1"),
            timestamp: 0,
            data,
        };
        assert!(decode_packet(&inbound).is_none());
    }
}
