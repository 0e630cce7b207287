//! Control packet model and plain wire format
//!
//! ```text
//! [opcode][session id 8][ack count 1][ack id 4]*[ack remote session id 8]?[packet id 4]?[payload]
//! ```
//!
//! The remote session id is present only with a non-zero ack count, the
//! packet id is absent from ACK_V1 packets.

use super::constants::{ACK_LENGTH_LENGTH, PACKET_ID_LENGTH, SESSION_ID_LENGTH};
use super::{opcode, parse_opcode, PacketCode};
use crate::error::{Result, VpnError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

pub type SessionId = [u8; SESSION_ID_LENGTH];

/// A control channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: PacketCode,
    pub key: u8,
    pub session_id: SessionId,
    pub packet_id: u32,
    pub payload: Option<Bytes>,
    pub ack_ids: Vec<u32>,
    pub ack_remote_session_id: Option<SessionId>,
}

impl ControlPacket {
    pub fn new(
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        packet_id: u32,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            code,
            key,
            session_id,
            packet_id,
            payload,
            ack_ids: Vec::new(),
            ack_remote_session_id: None,
        }
    }

    /// An ACK_V1 packet for a batch of ids
    pub fn ack(key: u8, session_id: SessionId, ack_ids: Vec<u32>, ack_remote_session_id: SessionId) -> Self {
        Self {
            code: PacketCode::AckV1,
            key,
            session_id,
            packet_id: 0,
            payload: None,
            ack_ids,
            ack_remote_session_id: Some(ack_remote_session_id),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.code == PacketCode::AckV1
    }

    /// Length of the opcode and session id
    pub const HEADER_LENGTH: usize = 1 + SESSION_ID_LENGTH;

    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u8(opcode(self.code, self.key));
        buf.put_slice(&self.session_id);
    }

    /// Everything after the session id
    pub fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ack_ids.len() as u8);
        if !self.ack_ids.is_empty() {
            for id in &self.ack_ids {
                buf.put_u32(*id);
            }
            buf.put_slice(&self.ack_remote_session_id.unwrap_or_default());
        }
        if !self.is_ack() {
            buf.put_u32(self.packet_id);
            if let Some(payload) = &self.payload {
                buf.put_slice(payload);
            }
        }
    }

    pub fn body_length(&self) -> usize {
        let acks = if self.ack_ids.is_empty() {
            0
        } else {
            self.ack_ids.len() * PACKET_ID_LENGTH + SESSION_ID_LENGTH
        };
        let rest = if self.is_ack() {
            0
        } else {
            PACKET_ID_LENGTH + self.payload.as_ref().map_or(0, Bytes::len)
        };
        ACK_LENGTH_LENGTH + acks + rest
    }

    /// Plain wire encoding
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LENGTH + self.body_length());
        self.write_header(&mut buf);
        self.write_body(&mut buf);
        buf.freeze()
    }

    /// Parse the opcode and session id
    pub fn parse_header(data: &[u8]) -> Result<(PacketCode, u8, SessionId)> {
        if data.len() < Self::HEADER_LENGTH {
            return Err(VpnError::ControlChannel(format!(
                "Missing opcode and session id ({} bytes)",
                data.len()
            )));
        }
        let (code, key) = parse_opcode(data[0])?;
        let mut session_id = SessionId::default();
        session_id.copy_from_slice(&data[1..Self::HEADER_LENGTH]);
        Ok((code, key, session_id))
    }

    /// Parse the part after the session id
    pub fn parse_body(code: PacketCode, key: u8, session_id: SessionId, body: &[u8]) -> Result<Self> {
        let mut body = body;
        if body.remaining() < ACK_LENGTH_LENGTH {
            return Err(VpnError::ControlChannel("Missing ack count".to_string()));
        }
        let ack_count = body.get_u8() as usize;

        let mut ack_ids = Vec::with_capacity(ack_count);
        let mut ack_remote_session_id = None;
        if ack_count > 0 {
            if body.remaining() < ack_count * PACKET_ID_LENGTH {
                return Err(VpnError::ControlChannel(format!(
                    "Missing ack ids ({ack_count} announced)"
                )));
            }
            for _ in 0..ack_count {
                ack_ids.push(body.get_u32());
            }
            if body.remaining() < SESSION_ID_LENGTH {
                return Err(VpnError::ControlChannel(
                    "Missing ack remote session id".to_string(),
                ));
            }
            let mut remote = SessionId::default();
            body.copy_to_slice(&mut remote);
            ack_remote_session_id = Some(remote);
        }

        if code == PacketCode::AckV1 {
            if ack_ids.is_empty() {
                return Err(VpnError::ControlChannel("ACK without ack ids".to_string()));
            }
            return Ok(Self::ack(key, session_id, ack_ids, ack_remote_session_id.unwrap_or_default()));
        }

        if body.remaining() < PACKET_ID_LENGTH {
            return Err(VpnError::ControlChannel("Missing packet id".to_string()));
        }
        let packet_id = body.get_u32();
        let payload = (!body.is_empty()).then(|| Bytes::copy_from_slice(body));

        Ok(Self {
            code,
            key,
            session_id,
            packet_id,
            payload,
            ack_ids,
            ack_remote_session_id,
        })
    }

    /// Parse the plain wire encoding
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (code, key, session_id) = Self::parse_header(data)?;
        Self::parse_body(code, key, session_id, &data[Self::HEADER_LENGTH..])
    }
}

impl fmt::Display for ControlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} key {} sid {}",
            self.code,
            self.key,
            hex::encode(self.session_id)
        )?;
        if self.is_ack() {
            write!(f, " acks {:?}", self.ack_ids)?;
        } else {
            write!(f, " pid {}", self.packet_id)?;
            if let Some(payload) = &self.payload {
                write!(f, " [{} bytes]", payload.len())?;
            }
        }
        if let Some(remote) = &self.ack_remote_session_id {
            write!(f, " remote {}", hex::encode(remote))?;
        }
        Ok(())
    }
}
