//! Datagram link to the server

use super::packet_framing::{xor_in_place, xor_packet};
use super::Link;
use crate::config::{Endpoint, SocketType, XorMethod};
use crate::error::{Result, VpnError};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;

const MAX_DATAGRAM: usize = 65_535;
/// Datagrams drained per read once the first one arrived
const MAX_BATCH: usize = 64;

/// [`Link`] over a connected UDP socket
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    xor_method: Option<XorMethod>,
    closed: watch::Sender<bool>,
}

impl UdpLink {
    /// Resolve the endpoint and connect a fresh socket to it
    pub async fn connect(endpoint: &Endpoint, xor_method: Option<XorMethod>) -> Result<Self> {
        let remote = tokio::net::lookup_host((endpoint.address.as_str(), endpoint.port))
            .await?
            .next()
            .ok_or_else(|| VpnError::Link(format!("Cannot resolve {}", endpoint.address)))?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        info!("UDP link connected to {remote}");
        Ok(Self::from_socket(socket, remote, xor_method))
    }

    /// Wrap a socket already connected to `remote`
    pub fn from_socket(socket: UdpSocket, remote: SocketAddr, xor_method: Option<XorMethod>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket,
            remote,
            xor_method,
            closed,
        }
    }

    async fn read(&self) -> Result<Vec<Bytes>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(VpnError::Link("Link is shut down".to_string()));
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let length = tokio::select! {
            received = self.socket.recv(&mut buf) => received?,
            _ = closed.changed() => return Err(VpnError::Link("Link is shut down".to_string())),
        };
        let mut packets = vec![self.unscramble(&mut buf[..length])];

        while packets.len() < MAX_BATCH {
            match self.socket.try_recv(&mut buf) {
                Ok(length) => packets.push(self.unscramble(&mut buf[..length])),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(packets)
    }

    fn unscramble(&self, datagram: &mut [u8]) -> Bytes {
        if let Some(method) = &self.xor_method {
            xor_in_place(datagram, method, false);
        }
        Bytes::copy_from_slice(datagram)
    }

    async fn write(&self, packets: Vec<Bytes>) -> Result<()> {
        for packet in packets {
            let datagram = xor_packet(&packet, self.xor_method.as_ref(), true);
            self.socket.send(&datagram).await?;
        }
        Ok(())
    }
}

impl Link for UdpLink {
    fn remote_address(&self) -> String {
        self.remote.ip().to_string()
    }

    fn remote_protocol(&self) -> SocketType {
        SocketType::Udp
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn read_packets(&self) -> BoxFuture<'_, Result<Vec<Bytes>>> {
        self.read().boxed()
    }

    fn write_packets(&self, packets: Vec<Bytes>) -> BoxFuture<'_, Result<()>> {
        self.write(packets).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async move {
            debug!("Shutting down UDP link to {}", self.remote);
            self.closed.send_replace(true);
        }
        .boxed()
    }
}
