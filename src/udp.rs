//! UDP binding of the datagram boundary.
use async_std::net::UdpSocket;
use async_trait::async_trait;
use bytes::BytesMut;
use channel::Datagram;
use std::io::Result;
use std::net::SocketAddr;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// A [`Datagram`] endpoint backed by a UDP socket.
pub struct Udp {
    socket: UdpSocket,
}

impl Udp {
    /// Binds a UDP socket to `addr`. A port of 0 asks the OS to pick one;
    /// the result can be queried through `Datagram::local_addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Datagram for Udp {
    async fn recv(&self) -> Result<(BytesMut, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        Ok((BytesMut::from(&buf[..len]), src))
    }

    async fn send(&self, buf: &[u8], dst: SocketAddr) -> Result<()> {
        self.socket.send_to(buf, dst).await?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }
}
