//! Control packet wire formats
//!
//! - plain: see [`ControlPacket`]
//! - tls-auth: `[opcode][session id][hmac][replay id][timestamp][body]`, the
//!   HMAC covers `replay id || timestamp || opcode || session id || body`
//! - tls-crypt: `[opcode][session id][replay id][timestamp][tag][encrypted body]`,
//!   the first 17 bytes are the additional data

use super::constants::{REPLAY_ID_LENGTH, TIMESTAMP_LENGTH};
use super::packets::ControlPacket;
use crate::config::{Digest, StaticKey, TlsWrapStrategy};
use crate::crypto::{zeroing, CipherAlgorithm, CryptoBox, CryptoBoxFactory, CryptoFlags, CryptoOptions};
use crate::error::{Result, VpnError};
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use std::time::{SystemTime, UNIX_EPOCH};

const REPLAY_HEADER_LENGTH: usize = REPLAY_ID_LENGTH + TIMESTAMP_LENGTH;

fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default()
}

/// Outbound replay id and timestamp shared by the wrapped formats
#[derive(Debug)]
struct ReplayCounter {
    next_id: u32,
    timestamp: u32,
}

impl ReplayCounter {
    fn new() -> Self {
        Self {
            next_id: 1,
            timestamp: epoch_seconds(),
        }
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// HMAC-authenticated control packets
pub struct AuthSerializer {
    crypto: Box<dyn CryptoBox>,
    digest_length: usize,
    replay: ReplayCounter,
}

impl AuthSerializer {
    pub fn new(factory: &CryptoBoxFactory, digest: Digest, key: &StaticKey) -> Result<Self> {
        let mut crypto = factory();
        crypto.configure(CryptoOptions {
            digest: Some(digest),
            hmac_enc_key: Some(zeroing(key.hmac_send_key())),
            hmac_dec_key: Some(zeroing(key.hmac_receive_key())),
            ..Default::default()
        })?;
        Ok(Self {
            digest_length: crypto.digest_length(),
            crypto,
            replay: ReplayCounter::new(),
        })
    }

    fn serialize(&mut self, packet: &ControlPacket, timestamp: u32) -> Result<Bytes> {
        let mut signed = BytesMut::with_capacity(
            REPLAY_HEADER_LENGTH + ControlPacket::HEADER_LENGTH + packet.body_length(),
        );
        signed.put_u32(self.replay.next());
        signed.put_u32(timestamp);
        packet.write_header(&mut signed);
        packet.write_body(&mut signed);

        // tag || replay id || timestamp || header || body
        let tagged = self.crypto.encrypt(&signed, CryptoFlags::default())?;
        let digest = self.digest_length;
        let header_end = digest + REPLAY_HEADER_LENGTH + ControlPacket::HEADER_LENGTH;
        let mut out = BytesMut::with_capacity(tagged.len());
        out.put_slice(&tagged[digest + REPLAY_HEADER_LENGTH..header_end]);
        out.put_slice(&tagged[..digest + REPLAY_HEADER_LENGTH]);
        out.put_slice(&tagged[header_end..]);
        Ok(out.freeze())
    }

    fn deserialize(&self, packet: &[u8]) -> Result<ControlPacket> {
        let digest = self.digest_length;
        let body_start = ControlPacket::HEADER_LENGTH + digest + REPLAY_HEADER_LENGTH;
        if packet.len() < body_start {
            return Err(VpnError::ControlChannel(format!(
                "Missing HMAC or replay header ({} bytes)",
                packet.len()
            )));
        }
        let (code, key, session_id) = ControlPacket::parse_header(packet)?;

        let mut signed = Vec::with_capacity(packet.len());
        signed.extend_from_slice(&packet[ControlPacket::HEADER_LENGTH..body_start]);
        signed.extend_from_slice(&packet[..ControlPacket::HEADER_LENGTH]);
        signed.extend_from_slice(&packet[body_start..]);
        self.crypto.verify(&signed, CryptoFlags::default())?;

        trace!(
            "tls-auth replay header {}",
            hex::encode(&packet[body_start - REPLAY_HEADER_LENGTH..body_start])
        );
        ControlPacket::parse_body(code, key, session_id, &packet[body_start..])
    }
}

/// Encrypted control packets
pub struct CryptSerializer {
    crypto: Box<dyn CryptoBox>,
    replay: ReplayCounter,
}

impl CryptSerializer {
    const AD_LENGTH: usize = ControlPacket::HEADER_LENGTH + REPLAY_HEADER_LENGTH;

    pub fn new(factory: &CryptoBoxFactory, key: &StaticKey) -> Result<Self> {
        let mut crypto = factory();
        crypto.configure(CryptoOptions {
            cipher: Some(CipherAlgorithm::Aes256Ctr),
            digest: Some(Digest::Sha256),
            cipher_enc_key: Some(zeroing(key.cipher_encrypt_key())),
            cipher_dec_key: Some(zeroing(key.cipher_decrypt_key())),
            hmac_enc_key: Some(zeroing(key.hmac_send_key())),
            hmac_dec_key: Some(zeroing(key.hmac_receive_key())),
        })?;
        Ok(Self {
            crypto,
            replay: ReplayCounter::new(),
        })
    }

    fn serialize(&mut self, packet: &ControlPacket, timestamp: u32) -> Result<Bytes> {
        let mut ad = BytesMut::with_capacity(Self::AD_LENGTH);
        packet.write_header(&mut ad);
        ad.put_u32(self.replay.next());
        ad.put_u32(timestamp);

        let mut body = BytesMut::with_capacity(packet.body_length());
        packet.write_body(&mut body);
        let sealed = self.crypto.encrypt(
            &body,
            CryptoFlags {
                ad: &ad,
                ..Default::default()
            },
        )?;

        ad.put_slice(&sealed);
        Ok(ad.freeze())
    }

    fn deserialize(&self, packet: &[u8]) -> Result<ControlPacket> {
        if packet.len() < Self::AD_LENGTH + self.crypto.tag_length() {
            return Err(VpnError::ControlChannel(format!(
                "Missing tls-crypt header ({} bytes)",
                packet.len()
            )));
        }
        let (code, key, session_id) = ControlPacket::parse_header(packet)?;
        let (ad, sealed) = packet.split_at(Self::AD_LENGTH);
        let body = self.crypto.decrypt(
            sealed,
            CryptoFlags {
                ad,
                ..Default::default()
            },
        )?;
        ControlPacket::parse_body(code, key, session_id, &body)
    }
}

/// Wire format of the control channel
pub enum ControlSerializer {
    Plain,
    Auth(AuthSerializer),
    Crypt(CryptSerializer),
}

impl ControlSerializer {
    /// Serializer for a `tls-auth` or `tls-crypt` static key
    pub fn wrapped(
        strategy: TlsWrapStrategy,
        key: &StaticKey,
        digest: Digest,
        factory: &CryptoBoxFactory,
    ) -> Result<Self> {
        Ok(match strategy {
            TlsWrapStrategy::Auth => ControlSerializer::Auth(AuthSerializer::new(factory, digest, key)?),
            TlsWrapStrategy::Crypt => ControlSerializer::Crypt(CryptSerializer::new(factory, key)?),
        })
    }

    pub fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        match self {
            ControlSerializer::Plain => Ok(packet.serialize()),
            ControlSerializer::Auth(auth) => {
                let timestamp = auth.replay.timestamp;
                auth.serialize(packet, timestamp)
            }
            ControlSerializer::Crypt(crypt) => {
                let timestamp = crypt.replay.timestamp;
                crypt.serialize(packet, timestamp)
            }
        }
    }

    /// Serialize with an explicit replay timestamp
    pub fn serialize_with_timestamp(&mut self, packet: &ControlPacket, timestamp: u32) -> Result<Bytes> {
        match self {
            ControlSerializer::Plain => Ok(packet.serialize()),
            ControlSerializer::Auth(auth) => auth.serialize(packet, timestamp),
            ControlSerializer::Crypt(crypt) => crypt.serialize(packet, timestamp),
        }
    }

    /// Parse `data[start..end]`, `end` defaults to the end of `data`
    pub fn deserialize(&self, data: &[u8], start: usize, end: Option<usize>) -> Result<ControlPacket> {
        let end = end.unwrap_or(data.len());
        let packet = data.get(start..end).ok_or_else(|| {
            VpnError::ControlChannel(format!(
                "Invalid range {start}..{end} of {} bytes",
                data.len()
            ))
        })?;
        match self {
            ControlSerializer::Plain => ControlPacket::deserialize(packet),
            ControlSerializer::Auth(auth) => auth.deserialize(packet),
            ControlSerializer::Crypt(crypt) => crypt.deserialize(packet),
        }
    }

    /// Restart the replay counter and refresh the timestamp
    pub fn reset(&mut self) {
        match self {
            ControlSerializer::Plain => {}
            ControlSerializer::Auth(AuthSerializer { replay, .. })
            | ControlSerializer::Crypt(CryptSerializer { replay, .. }) => *replay = ReplayCounter::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::STATIC_KEY_HEX;
    use crate::config::StaticKeyDirection;
    use crate::crypto::standard_crypto_factory;
    use crate::protocol::PacketCode;

    const TLS_AUTH_HARD_RESET: &str = "38bccfd171ce22e085e01a3454c354f3c3093b00fc8d6228a8b69ef503d56f6a572ebd26a800711b4cd4df2b9daf06cb90f82379e7815e39fb73be4ac5461752db4f35120474af82b2000000015b93b65d0000000000";
    const TLS_CRYPT_HARD_RESET: &str = "407bf3d6a260e6476d000000015ba4155887940856ddb70e01693980c5c955cb5506ecf9fd3e0bcee0c802ec269427d43bf1cda1837ffbf30c83cacff852cd0b7f4c";

    fn static_key(direction: StaticKeyDirection) -> StaticKey {
        StaticKey::new(hex::decode(STATIC_KEY_HEX).unwrap(), Some(direction)).unwrap()
    }

    fn wrapped(strategy: TlsWrapStrategy, direction: StaticKeyDirection, digest: Digest) -> ControlSerializer {
        ControlSerializer::wrapped(strategy, &static_key(direction), digest, &standard_crypto_factory()).unwrap()
    }

    fn sid(hex_id: &str) -> [u8; 8] {
        hex::decode(hex_id).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_tls_auth_known_frame() {
        let frame = hex::decode(TLS_AUTH_HARD_RESET).unwrap();
        let client = wrapped(TlsWrapStrategy::Auth, StaticKeyDirection::Client, Digest::Sha512);
        let packet = client.deserialize(&frame, 0, None).unwrap();
        assert_eq!(packet.code, PacketCode::HardResetClientV2);
        assert_eq!(packet.key, 0);
        assert_eq!(packet.session_id, sid("bccfd171ce22e085"));
        assert_eq!(packet.packet_id, 0);
        assert!(packet.ack_ids.is_empty());
        assert!(packet.payload.is_none());

        let mut server = wrapped(TlsWrapStrategy::Auth, StaticKeyDirection::Server, Digest::Sha512);
        let raw = server.serialize_with_timestamp(&packet, 0x5b93_b65d).unwrap();
        assert_eq!(hex::encode(raw), TLS_AUTH_HARD_RESET);
    }

    #[test]
    fn test_tls_crypt_known_frame() {
        let frame = hex::decode(TLS_CRYPT_HARD_RESET).unwrap();
        let client = wrapped(TlsWrapStrategy::Crypt, StaticKeyDirection::Client, Digest::Sha512);
        let packet = client.deserialize(&frame, 0, None).unwrap();
        assert_eq!(packet.code, PacketCode::HardResetServerV2);
        assert_eq!(packet.session_id, sid("7bf3d6a260e6476d"));
        assert_eq!(packet.ack_ids, vec![0]);
        assert_eq!(packet.ack_remote_session_id, Some(sid("a62ec85cc767f0a6")));
        assert_eq!(packet.packet_id, 0);

        let mut server = wrapped(TlsWrapStrategy::Crypt, StaticKeyDirection::Server, Digest::Sha512);
        let raw = server.serialize_with_timestamp(&packet, 0x5ba4_1558).unwrap();
        assert_eq!(hex::encode(raw), TLS_CRYPT_HARD_RESET);
    }

    #[test]
    fn test_cross_direction_round_trip() {
        let mut packet = ControlPacket::new(
            PacketCode::ControlV1,
            3,
            sid("0102030405060708"),
            42,
            Some(Bytes::from(vec![0x16; 300])),
        );
        packet.ack_ids = vec![40, 41];
        packet.ack_remote_session_id = Some(sid("1112131415161718"));

        for strategy in [TlsWrapStrategy::Auth, TlsWrapStrategy::Crypt] {
            let mut client = wrapped(strategy, StaticKeyDirection::Client, Digest::Sha256);
            let server = wrapped(strategy, StaticKeyDirection::Server, Digest::Sha256);
            let raw = client.serialize(&packet).unwrap();
            assert_eq!(server.deserialize(&raw, 0, None).unwrap(), packet);
            // own direction keys do not verify
            assert!(client.deserialize(&raw, 0, None).is_err());
        }
    }

    #[test]
    fn test_replay_ids_increase_and_reset() {
        let packet = ControlPacket::new(PacketCode::HardResetClientV2, 0, [7; 8], 0, None);
        let mut serializer = wrapped(TlsWrapStrategy::Auth, StaticKeyDirection::Client, Digest::Sha1);
        let replay_at = ControlPacket::HEADER_LENGTH + Digest::Sha1.length();
        let replay_id = |raw: &Bytes| u32::from_be_bytes(raw[replay_at..replay_at + 4].try_into().unwrap());

        let first = serializer.serialize(&packet).unwrap();
        let second = serializer.serialize(&packet).unwrap();
        assert_eq!(replay_id(&first), 1);
        assert_eq!(replay_id(&second), 2);
        serializer.reset();
        assert_eq!(replay_id(&serializer.serialize(&packet).unwrap()), 1);
    }

    #[test]
    fn test_tampered_frames_rejected() {
        for (strategy, frame) in [
            (TlsWrapStrategy::Auth, TLS_AUTH_HARD_RESET),
            (TlsWrapStrategy::Crypt, TLS_CRYPT_HARD_RESET),
        ] {
            let client = wrapped(strategy, StaticKeyDirection::Client, Digest::Sha512);
            let mut frame = hex::decode(frame).unwrap();
            let last = frame.len() - 1;
            frame[last] ^= 0x01;
            assert!(matches!(client.deserialize(&frame, 0, None), Err(VpnError::Crypto(_))));
            assert!(client.deserialize(&frame[..20], 0, None).is_err());
        }
    }

    #[test]
    fn test_plain_range() {
        let packet = ControlPacket::new(PacketCode::ControlV1, 0, [1; 8], 5, Some(Bytes::from_static(b"x")));
        let mut framed = vec![0xee, 0xee];
        framed.extend_from_slice(&packet.serialize());
        framed.push(0xee);
        let plain = ControlSerializer::Plain;
        let end = framed.len() - 1;
        assert_eq!(plain.deserialize(&framed, 2, Some(end)).unwrap(), packet);
        assert!(plain.deserialize(&framed, 5, Some(2)).is_err());
    }
}
