// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use crate::byte_array::ByteArray;
use crate::var_int::{VarInt, VarIntError};
use crate::{DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Upper bound on `Remaining Length` this broker accepts. Sessions only ever
/// exchange small command/status payloads, so anything above this is treated
/// as a malformed packet rather than parsed further.
pub const MAX_REMAINING_LENGTH: usize = 2_097_151;

pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// Get byte length in packet.
    ///
    /// # Errors
    /// Returns error if packet size is invalid.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Level of assurance for delivery of a `Publish` packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce,

    /// At least once delivery.
    AtLeastOnce,

    /// Exactly once delivery.
    ExactOnce,
}

impl QoS {
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// Packet types supported by this protocol subset. Unlike a general-purpose
/// MQTT broker, `PingRequest`/`PingResponse`/`PublishReceived`/`PublishRelease`/
/// `PublishComplete`/`Unsubscribe`/`UnsubscribeAck`/`Auth` are not part of the
/// wire protocol and are rejected at decode time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    #[default]
    Connect,
    ConnectAck,
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
    },
    PublishAck,
    Subscribe,
    SubscribeAck,
    Disconnect,
}

impl PacketType {
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Disconnect => 14,
        };

        let flags_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0b0000_0000 };
                dup | qos | retain
            }
            PacketType::Subscribe => 0b0000_0010,
            _ => 0b0000_0000,
        };
        (type_bits << 4) | flags_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type from one byte of the fixed header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacketType` for any type this subset does not
    /// implement, and `InvalidPacketFlags` if reserved flag bits are set.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        match type_bits {
            1 if flag == 0b0000_0000 => Ok(Self::Connect),
            2 if flag == 0b0000_0000 => Ok(Self::ConnectAck),
            3 => {
                let dup = (flag & 0b0000_1000) == 0b0000_1000;
                let retain = (flag & 0b0000_0001) == 0b0000_0001;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactOnce,
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                Ok(Self::Publish { dup, retain, qos })
            }
            4 if flag == 0b0000_0000 => Ok(Self::PublishAck),
            8 if flag == 0b0000_0010 => Ok(Self::Subscribe),
            9 if flag == 0b0000_0000 => Ok(Self::SubscribeAck),
            14 if flag == 0b0000_0000 => Ok(Self::Disconnect),
            1 | 2 | 4 | 8 | 9 | 14 => {
                log::error!("header: bad flag bits {flag:#06b} for type {type_bits}");
                Err(DecodeError::InvalidPacketFlags)
            }
            t => {
                log::warn!("header: unsupported packet type bits {t:#06b}");
                Err(DecodeError::InvalidPacketType)
            }
        }
    }
}

/// Fixed header part of a control packet. Consists of at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header with `packet_type` and `remaining_length`.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is invalid.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = VarInt::from(remaining_length)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;

        if remaining_length.value() > MAX_REMAINING_LENGTH {
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        v.push(packet_type);
        self.remaining_length.encode(v)?;
        Ok(PacketType::bytes() + self.remaining_length.bytes())
    }
}

/// Two-byte packet identifier used to correlate `Publish`/`PublishAck` and
/// `Subscribe`/`SubscribeAck` pairs. This protocol subset always includes it
/// on `Publish`, regardless of `QoS` (see `publish.rs`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(Self(ba.read_u16()?))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push((self.0 >> 8) as u8);
        buf.push((self.0 & 0xff) as u8);
        Ok(Self::bytes())
    }
}
