// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::byte_array::ByteArray;
use crate::header::{FixedHeader, Packet, PacketType};
use crate::string_data::StringData;
use crate::var_int::VarIntError;
use crate::{DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Fixed MQTT protocol name, "MQTT", used by v3.1.1.
const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// `ConnectPacket` is sent from the printer (the MQTT client in this
/// protocol's polarity) once it dials the controller-hosted broker.
///
/// Clean-session, will, username/password and keep-alive machinery from full
/// MQTT are not exercised by this subset: the fixed header carries a
/// constant connect-flags byte of zero and no payload beyond the client id.
///
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// +----------------------------+
/// | Protocol name length + "MQTT" |
/// +----------------------------+
/// | Protocol level (4)         |
/// +----------------------------+
/// | Connect flags (0)          |
/// +----------------------------+
/// | Keep alive                 |
/// +----------------------------+
/// | Client id length + string  |
/// +----------------------------+
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    keep_alive: u16,
    client_id: StringData,
}

impl ConnectPacket {
    /// Create a new connect packet with `client_id` (the mainboard id).
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is too long to encode.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        Ok(Self {
            keep_alive: 60,
            client_id: StringData::from(client_id)?,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length =
            StringData::from(PROTOCOL_NAME).unwrap().bytes() + 1 + 1 + 2 + self.client_id.bytes();
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ba.read_byte()?;
        if protocol_level != PROTOCOL_LEVEL {
            return Err(DecodeError::InvalidProtocolLevel);
        }

        // Connect flags: unused by this subset, but still present on the wire.
        let _connect_flags = ba.read_byte()?;
        let keep_alive = ba.read_u16()?;

        let client_id = StringData::decode(ba)?;

        Ok(Self {
            keep_alive,
            client_id,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        StringData::from(PROTOCOL_NAME)?.encode(v)?;
        v.push(PROTOCOL_LEVEL);
        v.push(0); // connect flags
        v.push((self.keep_alive >> 8) as u8);
        v.push((self.keep_alive & 0xff) as u8);
        self.client_id.encode(v)?;

        Ok(v.len() - old_len)
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = ConnectPacket::new("mainboard-01").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.client_id(), "mainboard-01");
    }

    #[test]
    fn test_rejects_bad_protocol_name() {
        let buf: Vec<u8> = vec![0x10, 0x09, 0x00, 0x03, b'M', b'Q', b'X', 0x04, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert!(ConnectPacket::decode(&mut ba).is_err());
    }
}
