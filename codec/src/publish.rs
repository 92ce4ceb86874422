// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::byte_array::ByteArray;
use crate::header::{FixedHeader, Packet, PacketId, PacketType, QoS};
use crate::topic::Topic;
use crate::var_int::VarIntError;
use crate::{DecodeError, DecodePacket, EncodeError, EncodePacket};

/// `PublishPacket` carries an application message (a JSON command envelope
/// or a status/response payload) from one side of the session to the other.
///
/// Unlike general MQTT, this protocol subset always includes `packet_id` on
/// the wire regardless of `QoS` — the firmware this broker talks to encodes
/// it unconditionally, so decoding must expect it unconditionally too.
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// +-----------------------+
/// | Topic name length+str |
/// +-----------------------+
/// | Packet Identifier     |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishPacket {
    dup: bool,
    qos: QoS,
    retain: bool,
    topic: Topic,
    packet_id: PacketId,
    payload: Vec<u8>,
}

impl PublishPacket {
    /// Create a new publish packet with `QoS::AtMostOnce`.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, packet_id: u16, payload: &[u8]) -> Result<Self, EncodeError> {
        Ok(Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Topic::new(topic)?,
            packet_id: PacketId::new(packet_id),
            payload: payload.to_vec(),
        })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length = self.topic.bytes() + PacketId::bytes() + self.payload.len();
        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let (dup, qos, retain) =
            if let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() {
                (dup, qos, retain)
            } else {
                return Err(DecodeError::InvalidPacketType);
            };

        let topic = Topic::decode(ba)?;
        let packet_id = PacketId::decode(ba)?;

        let header_len = topic.bytes() + PacketId::bytes();
        if fixed_header.remaining_length() < header_len {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let payload_len = fixed_header.remaining_length() - header_len;
        let payload = ba.read_bytes(payload_len)?.to_vec();

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        self.topic.encode(v)?;
        self.packet_id.encode(v)?;
        v.extend_from_slice(&self.payload);

        Ok(v.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}
