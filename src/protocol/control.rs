//! Reliable control channel
//!
//! Outbound packets stay queued until the server acknowledges them and are
//! re-serialized whenever the retransmission interval elapses. Inbound
//! packets are reordered by packet id and released to the negotiator only
//! as an uninterrupted run starting at the next expected id.

use super::constants::SESSION_ID_LENGTH;
use super::packets::{ControlPacket, SessionId};
use super::serializer::ControlSerializer;
use super::PacketCode;
use crate::crypto::Prng;
use crate::error::{Result, VpnError};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Outbound {
    packet: ControlPacket,
    sent_at: Option<Instant>,
}

/// Control channel state for one session
pub struct ControlChannel {
    serializer: ControlSerializer,
    prng: Arc<dyn Prng>,
    session_id: SessionId,
    remote_session_id: Option<SessionId>,
    outbound_queue: VecDeque<Outbound>,
    next_outbound_id: u32,
    inbound_queue: Vec<ControlPacket>,
    next_inbound_id: u32,
    pending_acks: BTreeSet<u32>,
}

impl ControlChannel {
    pub fn new(serializer: ControlSerializer, prng: Arc<dyn Prng>) -> Self {
        let session_id = Self::random_session_id(prng.as_ref());
        Self {
            serializer,
            prng,
            session_id,
            remote_session_id: None,
            outbound_queue: VecDeque::new(),
            next_outbound_id: 0,
            inbound_queue: Vec::new(),
            next_inbound_id: 0,
            pending_acks: BTreeSet::new(),
        }
    }

    fn random_session_id(prng: &dyn Prng) -> SessionId {
        let mut id = [0u8; SESSION_ID_LENGTH];
        prng.fill(&mut id);
        id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.remote_session_id
    }

    pub fn set_remote_session_id(&mut self, remote_session_id: SessionId) {
        self.remote_session_id = Some(remote_session_id);
    }

    /// Clear queues and counters, and start over with a new session id when
    /// `for_new_session` is set
    pub fn reset(&mut self, for_new_session: bool) {
        if for_new_session {
            self.session_id = Self::random_session_id(self.prng.as_ref());
            self.remote_session_id = None;
            debug!("Control channel session id {}", hex::encode(self.session_id));
        }
        self.outbound_queue.clear();
        self.next_outbound_id = 0;
        self.inbound_queue.clear();
        self.next_inbound_id = 0;
        self.pending_acks.clear();
        self.serializer.reset();
    }

    /// Parse one packet and apply the acknowledgements it carries
    pub fn read_inbound_packet(&mut self, data: &[u8], offset: usize) -> Result<ControlPacket> {
        let packet = self.serializer.deserialize(data, offset, None)?;
        trace!("Control: read {packet}");

        if !packet.ack_ids.is_empty() {
            match packet.ack_remote_session_id {
                Some(remote) if remote == self.session_id => {}
                other => {
                    warn!(
                        "Control: ack for session {} instead of {}",
                        other.map(hex::encode).unwrap_or_default(),
                        hex::encode(self.session_id)
                    );
                    return Err(VpnError::SessionMismatch);
                }
            }
            self.read_acks(&packet.ack_ids);
        }
        Ok(packet)
    }

    fn read_acks(&mut self, ack_ids: &[u32]) {
        self.outbound_queue
            .retain(|outbound| !ack_ids.contains(&outbound.packet.packet_id));
        for id in ack_ids {
            self.pending_acks.remove(id);
        }
        trace!(
            "Control: acked {ack_ids:?}, {} still pending",
            self.pending_acks.len()
        );
    }

    /// Buffer an inbound packet and return the packets now deliverable in order
    pub fn enqueue_inbound_packet(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        if packet.packet_id < self.next_inbound_id {
            debug!("Control: dropping duplicate packet {}", packet.packet_id);
            return Vec::new();
        }
        match self
            .inbound_queue
            .binary_search_by_key(&packet.packet_id, |queued| queued.packet_id)
        {
            Ok(_) => debug!("Control: packet {} already queued", packet.packet_id),
            Err(position) => self.inbound_queue.insert(position, packet),
        }

        let ready = self
            .inbound_queue
            .iter()
            .zip(self.next_inbound_id..)
            .take_while(|(queued, expected)| queued.packet_id == *expected)
            .count();
        self.next_inbound_id += ready as u32;
        self.inbound_queue.drain(..ready).collect()
    }

    /// Split `payload` into packets of at most `max_packet_size` bytes,
    /// queue them and return their serialized form
    pub fn enqueue_outbound_packets(
        &mut self,
        code: PacketCode,
        key: u8,
        payload: &[u8],
        max_packet_size: usize,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        let fragments: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(max_packet_size.max(1)).collect()
        };
        for fragment in fragments {
            let packet = ControlPacket::new(
                code,
                key,
                self.session_id,
                self.next_outbound_id,
                (!fragment.is_empty()).then(|| Bytes::copy_from_slice(fragment)),
            );
            debug!("Control: enqueue {packet}");
            self.next_outbound_id += 1;
            self.outbound_queue.push_back(Outbound {
                packet,
                sent_at: None,
            });
        }
        self.write_outbound_packets(now, Duration::MAX)
    }

    /// Serialize queued packets never sent or last sent at least
    /// `resend_after` ago
    pub fn write_outbound_packets(&mut self, now: Instant, resend_after: Duration) -> Result<Vec<Bytes>> {
        let mut raw = Vec::new();
        for outbound in &mut self.outbound_queue {
            if let Some(sent_at) = outbound.sent_at {
                if now.saturating_duration_since(sent_at) < resend_after {
                    continue;
                }
                trace!("Control: resend {}", outbound.packet);
            }
            raw.push(self.serializer.serialize(&outbound.packet)?);
            outbound.sent_at = Some(now);
            self.pending_acks.insert(outbound.packet.packet_id);
        }
        Ok(raw)
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// An ACK_V1 packet for `ack_ids`
    pub fn write_acks(&mut self, key: u8, ack_ids: Vec<u32>, remote_session_id: SessionId) -> Result<Bytes> {
        let packet = ControlPacket::ack(key, self.session_id, ack_ids, remote_session_id);
        trace!("Control: write {packet}");
        self.serializer.serialize(&packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SystemPrng;
    use proptest::prelude::*;

    fn channel() -> ControlChannel {
        ControlChannel::new(ControlSerializer::Plain, Arc::new(SystemPrng))
    }

    fn inbound(packet_id: u32) -> ControlPacket {
        ControlPacket::new(PacketCode::ControlV1, 0, [9; 8], packet_id, None)
    }

    fn ids(packets: &[ControlPacket]) -> Vec<u32> {
        packets.iter().map(|p| p.packet_id).collect()
    }

    #[test]
    fn test_reorder_out_of_order_arrivals() {
        let mut control = channel();
        assert!(control.enqueue_inbound_packet(inbound(1)).is_empty());
        assert!(control.enqueue_inbound_packet(inbound(3)).is_empty());
        assert_eq!(ids(&control.enqueue_inbound_packet(inbound(0))), vec![0, 1]);
        assert!(control.enqueue_inbound_packet(inbound(0)).is_empty());
        assert_eq!(ids(&control.enqueue_inbound_packet(inbound(2))), vec![2, 3]);
        assert_eq!(ids(&control.enqueue_inbound_packet(inbound(4))), vec![4]);
    }

    #[test]
    fn test_fragmentation_and_ids() {
        let mut control = channel();
        let now = Instant::now();
        let payload = vec![0xab; 2500];
        let raw = control
            .enqueue_outbound_packets(PacketCode::ControlV1, 0, &payload, 1000, now)
            .unwrap();
        assert_eq!(raw.len(), 3);
        let sizes: Vec<usize> = raw
            .iter()
            .map(|r| ControlPacket::deserialize(r).unwrap().payload.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        let packet_ids: Vec<u32> = raw
            .iter()
            .map(|r| ControlPacket::deserialize(r).unwrap().packet_id)
            .collect();
        assert_eq!(packet_ids, vec![0, 1, 2]);
        assert!(control.has_pending_acks());

        let raw = control
            .enqueue_outbound_packets(PacketCode::HardResetClientV2, 0, &[], 1000, now)
            .unwrap();
        assert_eq!(raw.len(), 1);
        let packet = ControlPacket::deserialize(&raw[0]).unwrap();
        assert_eq!(packet.packet_id, 3);
        assert!(packet.payload.is_none());
    }

    #[test]
    fn test_retransmission_interval() {
        let mut control = channel();
        let start = Instant::now();
        let retx = Duration::from_millis(100);
        control
            .enqueue_outbound_packets(PacketCode::ControlV1, 0, b"hello", 1000, start)
            .unwrap();

        assert!(control.write_outbound_packets(start + Duration::from_millis(50), retx).unwrap().is_empty());
        let resent = control
            .write_outbound_packets(start + Duration::from_millis(100), retx)
            .unwrap();
        assert_eq!(resent.len(), 1);
        assert!(control.write_outbound_packets(start + Duration::from_millis(150), retx).unwrap().is_empty());
    }

    #[test]
    fn test_acks_clear_queue() {
        let mut control = channel();
        let now = Instant::now();
        control
            .enqueue_outbound_packets(PacketCode::ControlV1, 0, &[1; 30], 10, now)
            .unwrap();

        let ack = ControlPacket::ack(0, [5; 8], vec![0, 2], control.session_id()).serialize();
        let packet = control.read_inbound_packet(&ack, 0).unwrap();
        assert!(packet.is_ack());
        assert!(control.has_pending_acks());

        let later = now + Duration::from_secs(1);
        let resent = control.write_outbound_packets(later, Duration::ZERO).unwrap();
        assert_eq!(ids(&resent.iter().map(|r| ControlPacket::deserialize(r).unwrap()).collect::<Vec<_>>()), vec![1]);

        let ack = ControlPacket::ack(0, [5; 8], vec![1], control.session_id()).serialize();
        control.read_inbound_packet(&ack, 0).unwrap();
        assert!(!control.has_pending_acks());
        assert!(control.write_outbound_packets(later, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_ack_for_other_session_rejected() {
        let mut control = channel();
        let now = Instant::now();
        control
            .enqueue_outbound_packets(PacketCode::ControlV1, 0, b"data", 1000, now)
            .unwrap();

        let mut other = control.session_id();
        other[0] ^= 0xff;
        let ack = ControlPacket::ack(0, [5; 8], vec![0], other).serialize();
        assert!(matches!(
            control.read_inbound_packet(&ack, 0),
            Err(VpnError::SessionMismatch)
        ));
        assert!(control.has_pending_acks());
        let resent = control.write_outbound_packets(now, Duration::ZERO).unwrap();
        assert_eq!(resent.len(), 1);
    }

    #[test]
    fn test_reset() {
        let mut control = channel();
        let now = Instant::now();
        control.set_remote_session_id([4; 8]);
        control
            .enqueue_outbound_packets(PacketCode::ControlV1, 0, b"data", 1000, now)
            .unwrap();
        control.enqueue_inbound_packet(inbound(0));
        let session_id = control.session_id();

        control.reset(false);
        assert_eq!(control.session_id(), session_id);
        assert_eq!(control.remote_session_id(), Some([4; 8]));
        assert!(!control.has_pending_acks());
        assert_eq!(ids(&control.enqueue_inbound_packet(inbound(0))), vec![0]);

        control.reset(true);
        assert_ne!(control.session_id(), session_id);
        assert_eq!(control.remote_session_id(), None);
        let raw = control
            .enqueue_outbound_packets(PacketCode::ControlV1, 0, b"x", 1000, now)
            .unwrap();
        assert_eq!(ControlPacket::deserialize(&raw[0]).unwrap().packet_id, 0);
    }

    #[test]
    fn test_write_acks() {
        let mut control = channel();
        let raw = control.write_acks(1, vec![4, 5], [8; 8]).unwrap();
        let packet = ControlPacket::deserialize(&raw).unwrap();
        assert_eq!(packet.code, PacketCode::AckV1);
        assert_eq!(packet.key, 1);
        assert_eq!(packet.session_id, control.session_id());
        assert_eq!(packet.ack_remote_session_id, Some([8; 8]));
    }

    fn arrival_order() -> impl Strategy<Value = (u32, Vec<u32>)> {
        (1u32..48).prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<u32>>()).prop_shuffle(),
                proptest::collection::vec(0..n, 0..24),
            )
                .prop_map(move |(mut order, duplicates)| {
                    for (i, duplicate) in duplicates.into_iter().enumerate() {
                        let at = (i * 7) % (order.len() + 1);
                        order.insert(at, duplicate);
                    }
                    (n, order)
                })
        })
    }

    proptest! {
        #[test]
        fn prop_reordering_yields_sorted_unique_ids((n, order) in arrival_order()) {
            let mut control = channel();
            let mut delivered = Vec::new();
            for id in order {
                delivered.extend(ids(&control.enqueue_inbound_packet(inbound(id))));
            }
            prop_assert_eq!(delivered, (0..n).collect::<Vec<u32>>());
        }
    }
}
