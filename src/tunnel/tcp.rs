//! Stream link to the server, packets carry a 2-byte length prefix

use super::packet_framing::{outbound_stream, PacketStream};
use super::Link;
use crate::config::{Endpoint, SocketType, XorMethod};
use crate::error::{Result, VpnError};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

const READ_CHUNK: usize = 16 * 1024;

struct ReadState {
    half: OwnedReadHalf,
    stream: PacketStream,
}

/// [`Link`] over a TCP connection
pub struct TcpLink {
    reader: Mutex<ReadState>,
    writer: Mutex<OwnedWriteHalf>,
    remote: SocketAddr,
    xor_method: Option<XorMethod>,
    closed: watch::Sender<bool>,
}

impl TcpLink {
    pub async fn connect(endpoint: &Endpoint, xor_method: Option<XorMethod>) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.address.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        info!("TCP link connected to {}", stream.peer_addr()?);
        Self::from_stream(stream, xor_method)
    }

    pub fn from_stream(stream: TcpStream, xor_method: Option<XorMethod>) -> Result<Self> {
        let remote = stream.peer_addr()?;
        let (half, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            reader: Mutex::new(ReadState {
                half,
                stream: PacketStream::new(xor_method.clone()),
            }),
            writer: Mutex::new(writer),
            remote,
            xor_method,
            closed,
        })
    }

    async fn read(&self) -> Result<Vec<Bytes>> {
        let mut closed = self.closed.subscribe();
        let mut state = self.reader.lock().await;
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if *closed.borrow() {
                return Err(VpnError::Link("Link is shut down".to_string()));
            }
            let length = tokio::select! {
                read = state.half.read(&mut chunk) => read?,
                _ = closed.changed() => continue,
            };
            if length == 0 {
                return Err(VpnError::Link("Connection closed by server".to_string()));
            }
            let packets = state.stream.feed(&chunk[..length]);
            if !packets.is_empty() {
                return Ok(packets);
            }
        }
    }

    async fn write(&self, packets: Vec<Bytes>) -> Result<()> {
        let framed = outbound_stream(&packets, self.xor_method.as_ref())?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&framed).await?;
        Ok(())
    }
}

impl Link for TcpLink {
    fn remote_address(&self) -> String {
        self.remote.ip().to_string()
    }

    fn remote_protocol(&self) -> SocketType {
        SocketType::Tcp
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn read_packets(&self) -> BoxFuture<'_, Result<Vec<Bytes>>> {
        self.read().boxed()
    }

    fn write_packets(&self, packets: Vec<Bytes>) -> BoxFuture<'_, Result<()>> {
        self.write(packets).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async move {
            debug!("Shutting down TCP link to {}", self.remote);
            self.closed.send_replace(true);
            if let Err(e) = self.writer.lock().await.shutdown().await {
                debug!("TCP shutdown: {e}");
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::packet_framing::packets_from_stream;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_framed_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let endpoint = Endpoint {
            address: address.ip().to_string(),
            port: address.port(),
            protocol: SocketType::Tcp,
        };
        let method = XorMethod::XorPtrPos;

        let (link, accepted) = tokio::join!(
            TcpLink::connect(&endpoint, Some(method.clone())),
            listener.accept()
        );
        let link = link.unwrap();
        let (mut server, _) = accepted.unwrap();
        assert!(link.is_reliable());
        assert_eq!(link.remote_protocol(), SocketType::Tcp);

        link.write_packets(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")])
            .await
            .unwrap();
        let mut buf = vec![0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        let (packets, consumed) = packets_from_stream(&buf, Some(&method));
        assert_eq!(consumed, 10);
        assert_eq!(packets, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        // split the reply across writes, mid length prefix
        let framed = outbound_stream(&[Bytes::from_static(b"reply")], Some(&method)).unwrap();
        server.write_all(&framed[..1]).await.unwrap();
        server.flush().await.unwrap();
        let reader = tokio::spawn(async move {
            let packets = link.read_packets().await;
            (link, packets)
        });
        tokio::task::yield_now().await;
        server.write_all(&framed[1..]).await.unwrap();
        let (link, packets) = reader.await.unwrap();
        assert_eq!(packets.unwrap(), vec![Bytes::from_static(b"reply")]);

        drop(server);
        assert!(matches!(link.read_packets().await, Err(VpnError::Link(_))));
    }
}
