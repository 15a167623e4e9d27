use std::future::Future;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::obfuscation::{Direction, PacketProcessor};
use crate::session::{Configuration, LinkProtocol};

/// Largest datagram accepted from the link.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

const TCP_READ_CAPACITY: usize = 16 * 1024;

/// Packet-oriented connection to the server.
///
/// `read_packets` must be cancel-safe: the runner drops a pending read
/// whenever another event fires first.
pub trait LinkInterface: Send {
    /// Wait for one or more packets.
    fn read_packets(&mut self) -> impl Future<Output = Result<Vec<Bytes>>> + Send;

    /// Send packets in order.
    fn write_packets(&mut self, packets: &[Bytes]) -> impl Future<Output = Result<()>> + Send;

    /// Close the link.
    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Local tunnel device carrying IP packets.
///
/// `read_packets` must be cancel-safe.
pub trait TunnelInterface: Send {
    /// Wait for one or more outbound IP packets.
    fn read_packets(&mut self) -> impl Future<Output = Result<Vec<Bytes>>> + Send;

    /// Deliver decrypted IP packets.
    fn write_packets(&mut self, packets: &[Bytes]) -> impl Future<Output = Result<()>> + Send;
}

/// UDP link: one processed packet per datagram.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    processor: PacketProcessor,
    buffer: Vec<u8>,
}

impl UdpLink {
    /// Wrap a socket already connected to the server.
    pub fn new(socket: UdpSocket, processor: PacketProcessor) -> Self {
        Self {
            socket,
            processor,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Bind an ephemeral local port and connect it to `remote`.
    pub async fn connect(remote: SocketAddr, processor: PacketProcessor) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(%remote, local = %socket.local_addr()?, "link: udp connected");
        Ok(Self::new(socket, processor))
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl LinkInterface for UdpLink {
    async fn read_packets(&mut self) -> Result<Vec<Bytes>> {
        let n = self.socket.recv(&mut self.buffer).await?;
        trace!(len = n, "link: udp datagram");
        Ok(vec![self.processor.process_packet(&self.buffer[..n], Direction::Inbound)])
    }

    async fn write_packets(&mut self, packets: &[Bytes]) -> Result<()> {
        for packet in packets {
            let datagram = self.processor.process_packet(packet, Direction::Outbound);
            self.socket.send(&datagram).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// TCP link: length-prefixed processed packets over a stream.
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    processor: PacketProcessor,
    buffer: BytesMut,
}

impl TcpLink {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, processor: PacketProcessor) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            processor,
            buffer: BytesMut::with_capacity(TCP_READ_CAPACITY),
        })
    }

    /// Connect to `remote`.
    pub async fn connect(remote: SocketAddr, processor: PacketProcessor) -> Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        debug!(%remote, "link: tcp connected");
        Self::new(stream, processor)
    }
}

impl LinkInterface for TcpLink {
    async fn read_packets(&mut self) -> Result<Vec<Bytes>> {
        loop {
            let (packets, consumed) = self.processor.packets(&self.buffer);
            if !packets.is_empty() {
                self.buffer.advance(consumed);
                return Ok(packets);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(Error::link("connection closed by server"));
            }
        }
    }

    async fn write_packets(&mut self, packets: &[Bytes]) -> Result<()> {
        if packets.is_empty() {
            return Ok(());
        }
        let frames = self.processor.stream(packets)?;
        self.stream.write_all(&frames).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Link selected by the configured protocol.
#[derive(Debug)]
pub enum Link {
    /// Datagram link
    Udp(UdpLink),
    /// Stream link
    Tcp(TcpLink),
}

impl Link {
    /// Resolve the configured remote and connect with its protocol and
    /// scrambling method.
    pub async fn connect(config: &Configuration) -> Result<Self> {
        let address = config.remote_address();
        let remote = tokio::net::lookup_host(&address)
            .await?
            .next()
            .ok_or_else(|| Error::link(format!("cannot resolve {}", address)))?;
        let processor = PacketProcessor::new(config.xor_method.clone());
        match config.protocol {
            LinkProtocol::Udp => Ok(Link::Udp(UdpLink::connect(remote, processor).await?)),
            LinkProtocol::Tcp => Ok(Link::Tcp(TcpLink::connect(remote, processor).await?)),
        }
    }
}

impl LinkInterface for Link {
    async fn read_packets(&mut self) -> Result<Vec<Bytes>> {
        match self {
            Link::Udp(link) => link.read_packets().await,
            Link::Tcp(link) => link.read_packets().await,
        }
    }

    async fn write_packets(&mut self, packets: &[Bytes]) -> Result<()> {
        match self {
            Link::Udp(link) => link.write_packets(packets).await,
            Link::Tcp(link) => link.write_packets(packets).await,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self {
            Link::Udp(link) => link.shutdown().await,
            Link::Tcp(link) => link.shutdown().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::XorMethod;
    use tokio::net::TcpListener;

    fn scrambler() -> PacketProcessor {
        PacketProcessor::new(Some(XorMethod::XorMask(vec![0x0f])))
    }

    #[tokio::test]
    async fn test_udp_link_scrambles_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut link = UdpLink::connect(peer.local_addr().unwrap(), scrambler()).await.unwrap();
        peer.connect(link.local_addr().unwrap()).await.unwrap();

        link.write_packets(&[Bytes::from_static(&[0x38, 0x01])]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x37, 0x0e]);

        peer.send(&[0x47, 0x0f]).await.unwrap();
        assert_eq!(link.read_packets().await.unwrap(), vec![Bytes::from_static(&[0x48, 0x00])]);
    }

    #[tokio::test]
    async fn test_tcp_link_frames_and_reassembles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (link, accepted) = tokio::join!(TcpLink::connect(addr, scrambler()), listener.accept());
        let mut link = link.unwrap();
        let (mut peer, _) = accepted.unwrap();

        link.write_packets(&[Bytes::from_static(&[0x20]), Bytes::from_static(&[0x28, 0x01])])
            .await
            .unwrap();
        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x01, 0x2f, 0x00, 0x02, 0x27, 0x0e]);

        // one frame split across writes, followed by a partial second frame
        peer.write_all(&[0x00, 0x03, 0x0f]).await.unwrap();
        peer.flush().await.unwrap();
        let read = tokio::spawn(async move {
            let first = link.read_packets().await.unwrap();
            (link, first)
        });
        peer.write_all(&[0x0e, 0x0d, 0x00, 0x02, 0x0f]).await.unwrap();
        let (mut link, first) = read.await.unwrap();
        assert_eq!(first, vec![Bytes::from_static(&[0x00, 0x01, 0x02])]);

        peer.write_all(&[0x0f]).await.unwrap();
        assert_eq!(link.read_packets().await.unwrap(), vec![Bytes::from_static(&[0x00, 0x00])]);

        drop(peer);
        assert!(matches!(link.read_packets().await, Err(Error::LinkFailure(_))));
    }
}
