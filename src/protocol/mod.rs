//! OpenVPN wire protocol: packet codes, control channel, negotiation and data path

pub mod auth;
pub mod control;
pub mod data;
pub mod hard_reset;
pub mod negotiator;
pub mod packets;
pub mod push_reply;
pub mod serializer;

use crate::error::{Result, VpnError};

/// Protocol constants
pub mod constants {
    /// Length of a control channel session id
    pub const SESSION_ID_LENGTH: usize = 8;
    /// Length of a packet id
    pub const PACKET_ID_LENGTH: usize = 4;
    /// Length of the ack count field
    pub const ACK_LENGTH_LENGTH: usize = 1;
    /// Length of the DATA_V2 peer id
    pub const PEER_ID_LENGTH: usize = 3;
    /// Peer id signaling DATA_V1 framing
    pub const PEER_ID_DISABLED: u32 = 0x00ff_ffff;
    /// Length of the tls-auth/tls-crypt replay id
    pub const REPLAY_ID_LENGTH: usize = 4;
    /// Length of the tls-auth/tls-crypt timestamp
    pub const TIMESTAMP_LENGTH: usize = 4;
    /// Opcode plus session id
    pub const CONTROL_HEADER_LENGTH: usize = 1 + SESSION_ID_LENGTH;
    /// Number of key slots addressable by the opcode
    pub const KEY_COUNT: u8 = 8;

    /// Payload of a keepalive ping
    pub const PING_STRING: [u8; 16] = [
        0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f,
        0xc7, 0x48,
    ];

    /// OCC message magic
    pub const OCC_MAGIC: [u8; 16] = [
        0x28, 0x7f, 0x34, 0x6b, 0xd4, 0xef, 0x7a, 0x81, 0x2d, 0x56, 0xb8, 0xd3, 0xaf, 0xc5,
        0x45, 0x9c,
    ];

    /// OCC opcode telling the server the client is exiting
    pub const OCC_EXIT: u8 = 0x06;

    /// Request for the server's pushed options
    pub const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

    // Compression framing bytes
    pub const DATA_PACKET_NO_COMPRESS: u8 = 0xfa;
    pub const DATA_PACKET_NO_COMPRESS_SWAP: u8 = 0xfb;
    pub const DATA_PACKET_LZO_COMPRESS: u8 = 0x66;
    pub const DATA_PACKET_V2_INDICATOR: u8 = 0x50;
    pub const DATA_PACKET_V2_UNCOMPRESSED: u8 = 0x00;
}

/// The OCC exit notification sent over the data channel at shutdown
pub fn occ_exit_payload() -> Vec<u8> {
    let mut payload = constants::OCC_MAGIC.to_vec();
    payload.push(constants::OCC_EXIT);
    payload
}

/// Control and data packet codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCode {
    SoftResetV1 = 0x03,
    ControlV1 = 0x04,
    AckV1 = 0x05,
    DataV1 = 0x06,
    HardResetClientV2 = 0x07,
    HardResetServerV2 = 0x08,
    DataV2 = 0x09,
}

impl PacketCode {
    pub fn is_data(self) -> bool {
        matches!(self, PacketCode::DataV1 | PacketCode::DataV2)
    }
}

impl TryFrom<u8> for PacketCode {
    type Error = VpnError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x03 => Ok(PacketCode::SoftResetV1),
            0x04 => Ok(PacketCode::ControlV1),
            0x05 => Ok(PacketCode::AckV1),
            0x06 => Ok(PacketCode::DataV1),
            0x07 => Ok(PacketCode::HardResetClientV2),
            0x08 => Ok(PacketCode::HardResetServerV2),
            0x09 => Ok(PacketCode::DataV2),
            _ => Err(VpnError::Protocol(format!(
                "Unknown packet code: {value:#x}"
            ))),
        }
    }
}

/// Build an opcode byte from a code and a 3-bit key
pub fn opcode(code: PacketCode, key: u8) -> u8 {
    ((code as u8) << 3) | (key & 0b111)
}

/// Split an opcode byte into its code and key
pub fn parse_opcode(byte: u8) -> Result<(PacketCode, u8)> {
    Ok((PacketCode::try_from(byte >> 3)?, byte & 0b111))
}

/// Key following `key` in a renegotiation, never 0
pub fn next_key(key: u8) -> u8 {
    (key.wrapping_add(1) & 0b111).max(1)
}
