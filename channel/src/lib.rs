//! Defines the `Datagram` trait — the unreliable transport boundary.
//!
//! The transport core built on top of this trait assumes nothing from it:
//! datagrams may be dropped, duplicated or reordered, and no connection
//! state exists below this seam. Anything that can move an addressed byte
//! buffer between endpoints qualifies.
#![deny(missing_docs)]
#![deny(warnings)]
use async_trait::async_trait;
use bytes::BytesMut;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::{HashMap, VecDeque};
use std::io::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// An unreliable, unordered, addressed datagram endpoint.
#[async_trait]
pub trait Datagram: Send + Sync {
    /// Receives one datagram, returning its bytes and the source address.
    async fn recv(&self) -> Result<(BytesMut, SocketAddr)>;

    /// Sends one datagram to the destination address.
    ///
    /// A successful return means the datagram was handed to the transport,
    /// not that it was delivered.
    async fn send(&self, buf: &[u8], dst: SocketAddr) -> Result<()>;

    /// Returns the address this endpoint is reachable at.
    fn local_addr(&self) -> Result<SocketAddr>;
}

type Queues = HashMap<SocketAddr, VecDeque<(BytesMut, SocketAddr)>>;

/// An in-memory datagram network for tests and examples.
///
/// Endpoints are registered under a synthetic address and exchange datagrams
/// through shared per-endpoint queues. Sending to an unregistered address
/// silently drops the datagram, matching the fire-and-forget semantics of a
/// real datagram transport.
#[derive(Clone, Default)]
pub struct LoopbackNet {
    queues: Arc<Mutex<Queues>>,
}

impl LoopbackNet {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint reachable at `addr`.
    pub fn endpoint(&self, addr: SocketAddr) -> LoopbackEndpoint {
        self.queues
            .lock()
            .unwrap()
            .entry(addr)
            .or_insert_with(VecDeque::new);
        LoopbackEndpoint {
            net: self.clone(),
            addr,
        }
    }
}

/// One endpoint of a [`LoopbackNet`].
pub struct LoopbackEndpoint {
    net: LoopbackNet,
    addr: SocketAddr,
}

struct RecvFuture<'a>(&'a LoopbackEndpoint);

impl<'a> Future for RecvFuture<'a> {
    type Output = (BytesMut, SocketAddr);

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut queues = (self.0).net.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&self.0.addr) {
            if let Some(datagram) = queue.pop_front() {
                return Poll::Ready(datagram);
            }
        }
        cx.waker().clone().wake();
        Poll::Pending
    }
}

#[async_trait]
impl Datagram for LoopbackEndpoint {
    async fn recv(&self) -> Result<(BytesMut, SocketAddr)> {
        Ok(RecvFuture(self).await)
    }

    async fn send(&self, buf: &[u8], dst: SocketAddr) -> Result<()> {
        let mut queues = self.net.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&dst) {
            queue.push_back((BytesMut::from(buf), self.addr));
        }
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    async fn ping_pong() -> Result<()> {
        let net = LoopbackNet::new();
        let a = net.endpoint(addr(1));
        let b = net.endpoint(addr(2));

        a.send(b"ping", addr(2)).await?;
        let (bytes, src) = b.recv().await?;
        assert_eq!(&bytes[..], b"ping");
        assert_eq!(src, addr(1));

        b.send(b"pong", src).await?;
        let (bytes, src) = a.recv().await?;
        assert_eq!(&bytes[..], b"pong");
        assert_eq!(src, addr(2));
        Ok(())
    }

    #[test]
    fn test_ping_pong() {
        task::block_on(ping_pong()).unwrap();
    }

    #[test]
    fn test_unknown_destination_is_dropped() {
        task::block_on(async {
            let net = LoopbackNet::new();
            let a = net.endpoint(addr(1));
            a.send(b"void", addr(9)).await.unwrap();
            // registering afterwards must not resurrect the datagram
            let b = net.endpoint(addr(9));
            a.send(b"real", addr(9)).await.unwrap();
            let (bytes, _) = b.recv().await.unwrap();
            assert_eq!(&bytes[..], b"real");
        });
    }

    #[test]
    fn test_fifo_per_endpoint() {
        task::block_on(async {
            let net = LoopbackNet::new();
            let a = net.endpoint(addr(1));
            let b = net.endpoint(addr(2));
            a.send(b"first", addr(2)).await.unwrap();
            a.send(b"second", addr(2)).await.unwrap();
            assert_eq!(&b.recv().await.unwrap().0[..], b"first");
            assert_eq!(&b.recv().await.unwrap().0[..], b"second");
        });
    }
}
