//! Data channel: tunnel payload encryption for one session key
//!
//! ```text
//! AEAD: [opcode][peer id 3]?[packet id 4][tag 16][ciphertext]
//! CBC:  [opcode][peer id 3]?[hmac][iv 16][cbc(packet id 4 || payload)]
//! ```
//!
//! With AEAD ciphers the header and packet id are authenticated as
//! additional data. DATA_V2 and its peer id are used when the server pushed
//! one.

use super::constants::{
    DATA_PACKET_LZO_COMPRESS, DATA_PACKET_NO_COMPRESS, DATA_PACKET_NO_COMPRESS_SWAP,
    DATA_PACKET_V2_INDICATOR, DATA_PACKET_V2_UNCOMPRESSED, PACKET_ID_LENGTH, PEER_ID_DISABLED,
    PEER_ID_LENGTH, PING_STRING,
};
use super::{opcode, parse_opcode, PacketCode};
use crate::config::{CompressionAlgorithm, CompressionFraming};
use crate::crypto::{CryptoBox, CryptoFlags};
use crate::error::{Result, VpnError};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};

const REPLAY_WINDOW_SIZE: u32 = 64;

/// Sliding window over the last 64 inbound packet ids
#[derive(Debug, Default, Clone)]
struct ReplayWindow {
    highest: u32,
    bitmap: u64,
}

impl ReplayWindow {
    fn accepts(&self, packet_id: u32) -> bool {
        if packet_id == 0 {
            return false;
        }
        if packet_id > self.highest {
            return true;
        }
        let age = self.highest - packet_id;
        age < REPLAY_WINDOW_SIZE && self.bitmap & (1 << age) == 0
    }

    fn update(&mut self, packet_id: u32) {
        if packet_id > self.highest {
            let shift = packet_id - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.highest = packet_id;
        } else {
            self.bitmap |= 1 << (self.highest - packet_id);
        }
    }
}

fn read_packet_id(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Result of decrypting a batch of data packets
#[derive(Debug, Default)]
pub struct DecryptedBatch {
    pub packets: Vec<Bytes>,
    /// At least one keepalive ping was received
    pub keep_alive: bool,
}

/// Packet-level data path bound to one negotiated crypto box
pub struct DataPath {
    crypto: Box<dyn CryptoBox>,
    peer_id: u32,
    framing: CompressionFraming,
    algorithm: CompressionAlgorithm,
    outbound_packet_id: u32,
    replay: Option<ReplayWindow>,
}

impl DataPath {
    pub fn new(
        crypto: Box<dyn CryptoBox>,
        peer_id: Option<u32>,
        framing: CompressionFraming,
        algorithm: CompressionAlgorithm,
        uses_replay_protection: bool,
    ) -> Self {
        Self {
            crypto,
            peer_id: peer_id.unwrap_or(PEER_ID_DISABLED) & PEER_ID_DISABLED,
            framing,
            algorithm,
            outbound_packet_id: 0,
            replay: uses_replay_protection.then(ReplayWindow::default),
        }
    }

    fn write_header(&self, key: u8, buf: &mut BytesMut) {
        if self.peer_id == PEER_ID_DISABLED {
            buf.put_u8(opcode(PacketCode::DataV1, key));
        } else {
            buf.put_u8(opcode(PacketCode::DataV2, key));
            buf.put_uint(self.peer_id as u64, PEER_ID_LENGTH);
        }
    }

    fn compress(&self, payload: &[u8], buf: &mut BytesMut) {
        match self.framing {
            CompressionFraming::Disabled => buf.put_slice(payload),
            CompressionFraming::CompLzo => {
                buf.put_u8(DATA_PACKET_NO_COMPRESS);
                buf.put_slice(payload);
            }
            CompressionFraming::Compress => match payload.split_first() {
                Some((first, rest)) => {
                    buf.put_u8(DATA_PACKET_NO_COMPRESS_SWAP);
                    buf.put_slice(rest);
                    buf.put_u8(*first);
                }
                None => buf.put_u8(DATA_PACKET_NO_COMPRESS),
            },
            CompressionFraming::CompressV2 => {
                if payload.first() == Some(&DATA_PACKET_V2_INDICATOR) {
                    buf.put_u8(DATA_PACKET_V2_INDICATOR);
                    buf.put_u8(DATA_PACKET_V2_UNCOMPRESSED);
                }
                buf.put_slice(payload);
            }
        }
    }

    fn decompress(&self, payload: &[u8]) -> Result<Bytes> {
        let unsupported = |byte: u8| {
            VpnError::Protocol(format!(
                "Compressed data packet ({byte:#04x}) not supported with {:?}",
                self.algorithm
            ))
        };
        match self.framing {
            CompressionFraming::Disabled => Ok(Bytes::copy_from_slice(payload)),
            CompressionFraming::CompLzo | CompressionFraming::Compress => match payload.split_first() {
                Some((&DATA_PACKET_NO_COMPRESS, rest)) => Ok(Bytes::copy_from_slice(rest)),
                Some((&DATA_PACKET_NO_COMPRESS_SWAP, rest)) => {
                    let mut out = BytesMut::with_capacity(rest.len());
                    if let Some((last, body)) = rest.split_last() {
                        out.put_u8(*last);
                        out.put_slice(body);
                    }
                    Ok(out.freeze())
                }
                Some((&byte, _)) => Err(unsupported(byte)),
                None => Err(VpnError::Protocol("Missing compression byte".to_string())),
            },
            CompressionFraming::CompressV2 => match payload {
                [DATA_PACKET_V2_INDICATOR, DATA_PACKET_V2_UNCOMPRESSED, rest @ ..] => {
                    Ok(Bytes::copy_from_slice(rest))
                }
                [DATA_PACKET_V2_INDICATOR, byte, ..] => Err(unsupported(*byte)),
                _ => Ok(Bytes::copy_from_slice(payload)),
            },
        }
    }

    fn next_packet_id(&mut self) -> Result<u32> {
        self.outbound_packet_id = self
            .outbound_packet_id
            .checked_add(1)
            .ok_or_else(|| VpnError::Crypto("Data packet id exhausted".to_string()))?;
        Ok(self.outbound_packet_id)
    }

    /// Encrypt tunnel packets for key `key`
    pub fn encrypt(&mut self, key: u8, packets: &[Bytes]) -> Result<Vec<Bytes>> {
        let mut out = Vec::with_capacity(packets.len());
        for payload in packets {
            let packet_id = self.next_packet_id()?;

            let mut framed = BytesMut::with_capacity(payload.len() + 2);
            self.compress(payload, &mut framed);

            let mut packet = BytesMut::with_capacity(
                1 + PEER_ID_LENGTH + PACKET_ID_LENGTH + self.crypto.tag_length() + framed.len(),
            );
            self.write_header(key, &mut packet);

            let sealed = if self.crypto.is_aead() {
                packet.put_u32(packet_id);
                let id_bytes = packet_id.to_be_bytes();
                self.crypto.encrypt(
                    &framed,
                    CryptoFlags {
                        iv: &id_bytes,
                        ad: &packet,
                    },
                )?
            } else {
                let mut plain = BytesMut::with_capacity(PACKET_ID_LENGTH + framed.len());
                plain.put_u32(packet_id);
                plain.put_slice(&framed);
                self.crypto.encrypt(&plain, CryptoFlags::default())?
            };
            packet.put_slice(&sealed);
            out.push(packet.freeze());
        }
        Ok(out)
    }

    fn decrypt_packet(&mut self, packet: &[u8]) -> Result<Option<Bytes>> {
        let (code, _) = parse_opcode(*packet.first().ok_or_else(|| {
            VpnError::Protocol("Empty data packet".to_string())
        })?)?;
        let header_length = match code {
            PacketCode::DataV1 => 1,
            PacketCode::DataV2 => 1 + PEER_ID_LENGTH,
            other => {
                return Err(VpnError::Protocol(format!("Not a data packet: {other:?}")));
            }
        };
        let too_short = || {
            VpnError::Protocol(format!("Data packet too short ({} bytes)", packet.len()))
        };

        let (packet_id, framed) = if self.crypto.is_aead() {
            let ad_length = header_length + PACKET_ID_LENGTH;
            if packet.len() < ad_length {
                return Err(too_short());
            }
            let id_bytes = &packet[header_length..ad_length];
            let packet_id = read_packet_id(id_bytes);
            if !self.accepts(packet_id) {
                return Ok(None);
            }
            let framed = self.crypto.decrypt(
                &packet[ad_length..],
                CryptoFlags {
                    iv: id_bytes,
                    ad: &packet[..ad_length],
                },
            )?;
            (packet_id, Bytes::from(framed))
        } else {
            let plain = Bytes::from(
                self.crypto
                    .decrypt(&packet[header_length..], CryptoFlags::default())?,
            );
            if plain.len() < PACKET_ID_LENGTH {
                return Err(too_short());
            }
            let packet_id = read_packet_id(&plain[..PACKET_ID_LENGTH]);
            if !self.accepts(packet_id) {
                return Ok(None);
            }
            (packet_id, plain.slice(PACKET_ID_LENGTH..))
        };
        if let Some(replay) = &mut self.replay {
            replay.update(packet_id);
        }

        if framed.first() == Some(&DATA_PACKET_LZO_COMPRESS)
            && self.framing != CompressionFraming::Disabled
        {
            warn!("Data: dropped LZO-compressed packet {packet_id}");
            return Ok(None);
        }
        self.decompress(&framed).map(Some)
    }

    fn accepts(&self, packet_id: u32) -> bool {
        let accepted = self
            .replay
            .as_ref()
            .map_or(true, |replay| replay.accepts(packet_id));
        if !accepted {
            debug!("Data: dropped replayed packet id {packet_id}");
        }
        accepted
    }

    /// Decrypt a batch of data packets, dropping those that fail
    pub fn decrypt(&mut self, packets: &[Bytes]) -> DecryptedBatch {
        let mut batch = DecryptedBatch::default();
        for packet in packets {
            match self.decrypt_packet(packet) {
                Ok(Some(payload)) if payload[..] == PING_STRING => {
                    trace!("Data: received ping");
                    batch.keep_alive = true;
                }
                Ok(Some(payload)) => batch.packets.push(payload),
                Ok(None) => {}
                Err(err) => warn!("Data: dropped packet: {err}"),
            }
        }
        batch
    }
}

/// Data path for one session key
pub struct DataChannel {
    key: u8,
    path: DataPath,
}

impl DataChannel {
    pub fn new(key: u8, path: DataPath) -> Self {
        Self { key, path }
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn encrypt(&mut self, packets: &[Bytes]) -> Result<Vec<Bytes>> {
        self.path.encrypt(self.key, packets)
    }

    pub fn decrypt(&mut self, packets: &[Bytes]) -> DecryptedBatch {
        self.path.decrypt(packets)
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("key", &self.key)
            .field("peer_id", &self.path.peer_id)
            .field("framing", &self.path.framing)
            .finish_non_exhaustive()
    }
}
