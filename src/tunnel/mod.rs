//! Transport interfaces of a session
//!
//! A [`Link`] carries OpenVPN packets to and from the server, a [`Tunnel`]
//! is the local packet source and sink (usually a TUN device). Both are
//! owned by the session, which runs one read loop per interface and never
//! issues a read before the previous batch has been handled.

use crate::config::SocketType;
use crate::error::Result;
use bytes::Bytes;
use futures::future::BoxFuture;

pub mod packet_framing;
#[cfg(feature = "tokio-runtime")]
pub mod tcp;
#[cfg(feature = "tokio-runtime")]
pub mod udp;

pub use packet_framing::PacketStream;

/// Transport to the VPN server
pub trait Link: Send + Sync {
    /// Address of the server, as reported to the session delegate
    fn remote_address(&self) -> String;

    fn remote_protocol(&self) -> SocketType;

    /// Whether the transport already guarantees delivery (TCP)
    fn is_reliable(&self) -> bool;

    /// Wait for the next batch of inbound packets
    fn read_packets(&self) -> BoxFuture<'_, Result<Vec<Bytes>>>;

    fn write_packets(&self, packets: Vec<Bytes>) -> BoxFuture<'_, Result<()>>;

    /// Close the transport, pending reads fail afterwards
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Local side of the tunnel
pub trait Tunnel: Send + Sync {
    fn read_packets(&self) -> BoxFuture<'_, Result<Vec<Bytes>>>;

    fn write_packets(&self, packets: Vec<Bytes>) -> BoxFuture<'_, Result<()>>;
}
