// Packet scrambling and stream framing for OpenVPN links
// The XOR methods sit below the OpenVPN framing, stream transports add a
// 2-byte big-endian length before each (scrambled) packet.

use crate::config::XorMethod;
use crate::error::{Result, VpnError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the stream framing prefix
pub const STREAM_LENGTH_PREFIX: usize = 2;

/// XOR with a repeating mask
pub fn xor_mask(data: &mut [u8], mask: &[u8]) {
    if mask.is_empty() {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % mask.len()];
    }
}

/// XOR each byte with its 1-based position, truncated to a byte
pub fn xor_ptr_pos(data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= (i + 1) as u8;
    }
}

/// Reverse everything but the first byte
pub fn reverse_order(data: &mut [u8]) {
    if data.len() > 1 {
        data[1..].reverse();
    }
}

/// Apply a scrambling method in place
pub fn xor_in_place(data: &mut [u8], method: &XorMethod, outbound: bool) {
    match method {
        XorMethod::XorMask { .. } => xor_mask(data, method.mask()),
        XorMethod::XorPtrPos => xor_ptr_pos(data),
        XorMethod::Reverse => reverse_order(data),
        XorMethod::Obfuscate { .. } => {
            if outbound {
                xor_ptr_pos(data);
                reverse_order(data);
                xor_ptr_pos(data);
                xor_mask(data, method.mask());
            } else {
                xor_mask(data, method.mask());
                xor_ptr_pos(data);
                reverse_order(data);
                xor_ptr_pos(data);
            }
        }
    }
}

/// Scramble a copy of `packet`, or return it as is without a method
pub fn xor_packet(packet: &[u8], method: Option<&XorMethod>, outbound: bool) -> Bytes {
    let mut out = BytesMut::from(packet);
    if let Some(method) = method {
        xor_in_place(&mut out, method, outbound);
    }
    out.freeze()
}

/// Extract every complete packet from a length-prefixed stream
///
/// Returns the packets, unscrambled, and the number of leading bytes they
/// occupied. Trailing partial data is left for the next call.
pub fn packets_from_stream(stream: &[u8], method: Option<&XorMethod>) -> (Vec<Bytes>, usize) {
    let mut packets = Vec::new();
    let mut consumed = 0;
    while consumed + STREAM_LENGTH_PREFIX <= stream.len() {
        let length = u16::from_be_bytes([stream[consumed], stream[consumed + 1]]) as usize;
        let start = consumed + STREAM_LENGTH_PREFIX;
        let end = start + length;
        if end > stream.len() {
            break;
        }
        packets.push(xor_packet(&stream[start..end], method, false));
        consumed = end;
    }
    (packets, consumed)
}

/// Frame packets for a stream transport
///
/// Fails without writing anything when a packet does not fit the 16-bit
/// length prefix.
pub fn outbound_stream(packets: &[Bytes], method: Option<&XorMethod>) -> Result<Bytes> {
    let total = packets
        .iter()
        .map(|p| STREAM_LENGTH_PREFIX + p.len())
        .sum();
    let mut out = BytesMut::with_capacity(total);
    for packet in packets {
        let length = u16::try_from(packet.len()).map_err(|_| {
            VpnError::Link(format!(
                "Packet of {} bytes exceeds the stream length prefix",
                packet.len()
            ))
        })?;
        out.put_u16(length);
        let start = out.len();
        out.put_slice(packet);
        if let Some(method) = method {
            xor_in_place(&mut out[start..], method, true);
        }
    }
    Ok(out.freeze())
}

/// Incremental reassembler for stream transports
#[derive(Debug, Default)]
pub struct PacketStream {
    buffer: BytesMut,
    method: Option<XorMethod>,
}

impl PacketStream {
    pub fn new(method: Option<XorMethod>) -> Self {
        Self {
            buffer: BytesMut::new(),
            method,
        }
    }

    /// Append received bytes and return the packets completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let (packets, consumed) = packets_from_stream(&self.buffer, self.method.as_ref());
        self.buffer.advance(consumed);
        packets
    }

    /// Bytes waiting for the rest of their packet
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
