//! Unreliable datagram networks for testing purposes.
#![deny(missing_docs)]
#![deny(warnings)]
use async_trait::async_trait;
use bytes::BytesMut;
use channel::{Datagram, LoopbackNet};
use crossbeam::atomic::AtomicCell;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::VecDeque;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// An in-memory datagram network that loses and duplicates traffic.
///
/// Every endpoint created from the same `LossyNet` shares the px/pq
/// parameters. See [`LossyNet::new`] for their meaning.
#[derive(Clone)]
pub struct LossyNet {
    px: f64,
    pq: f64,
    inner: LoopbackNet,
}

impl LossyNet {
    /// Creates a new lossy network.
    ///
    /// The px parameter defines the probability of a datagram getting
    /// transmitted.
    /// The pq parameter defines the probability of a datagram getting
    /// queued for delayed delivery.
    ///
    /// Through the combination of the px and pq parameters we can
    /// create networks that are reliable (px=1.0, pq=0.0), simulate
    /// network partitions (px=0.0, pq=0.0), deliver all datagrams twice
    /// (px=1.0, pq=1.0) or anything in between.
    pub fn new(px: f64, pq: f64) -> Self {
        assert!(0.0 <= px && px <= 1.0);
        assert!(0.0 <= pq && pq <= 1.0);
        Self {
            px,
            pq,
            inner: LoopbackNet::new(),
        }
    }

    /// Registers an endpoint reachable at `addr`.
    pub fn endpoint(&self, addr: SocketAddr) -> LossyEndpoint {
        LossyEndpoint {
            px: self.px,
            pq: self.pq,
            delayed: Default::default(),
            inner: self.inner.endpoint(addr),
        }
    }

    /// Returns the probability of an error condition occuring.
    pub fn probability(&self, cond: Tx) -> f64 {
        match cond {
            Tx::Success => self.px * (1.0 - self.pq),
            Tx::Delay => (1.0 - self.px) * self.pq,
            Tx::Duplicate => self.px * self.pq,
            Tx::Drop => (1.0 - self.px) * (1.0 - self.pq),
        }
    }
}

impl std::fmt::Display for LossyNet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "p(transmission) = {}", self.px)?;
        writeln!(f, "p(queue) = {}", self.pq)?;
        writeln!(f, "p(success) = {}", self.probability(Tx::Success))?;
        writeln!(f, "p(delay) = {}", self.probability(Tx::Delay))?;
        writeln!(f, "p(duplicate) = {}", self.probability(Tx::Duplicate))?;
        writeln!(f, "p(drop) = {}", self.probability(Tx::Drop))?;
        Ok(())
    }
}

/// Enumerates the error conditions during transmission.
pub enum Tx {
    /// Successfull transmission.
    Success,
    /// Datagram is delayed and will be received out of order.
    Delay,
    /// Datagram will be received twice.
    Duplicate,
    /// Datagram is dropped.
    Drop,
}

/// One endpoint of a [`LossyNet`].
pub struct LossyEndpoint {
    px: f64,
    pq: f64,
    delayed: Arc<Mutex<VecDeque<(BytesMut, SocketAddr)>>>,
    inner: channel::LoopbackEndpoint,
}

#[async_trait]
impl Datagram for LossyEndpoint {
    async fn recv(&self) -> Result<(BytesMut, SocketAddr)> {
        let datagram = self.inner.recv().await?;
        loop {
            let delayed = { self.delayed.lock().unwrap().pop_front() };
            if let Some((bytes, dst)) = delayed {
                self.inner.send(&bytes, dst).await?;
            } else {
                break;
            }
        }
        Ok(datagram)
    }

    async fn send(&self, buf: &[u8], dst: SocketAddr) -> Result<()> {
        let fate: f64 = OsRng.gen();
        if fate < self.px {
            self.inner.send(buf, dst).await?;
        }
        if fate < self.pq {
            self.delayed
                .lock()
                .unwrap()
                .push_back((BytesMut::from(buf), dst));
        }
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A deterministic loss filter around any datagram endpoint.
///
/// Drops the first `n` outbound datagrams whose bytes satisfy the predicate,
/// then behaves transparently. Used to target a specific protocol unit, e.g.
/// the first retransmissions of a handshake reply.
pub struct DropFirst<D> {
    inner: D,
    remaining: AtomicCell<u32>,
    matches: fn(&[u8]) -> bool,
}

impl<D> DropFirst<D> {
    /// Wraps `inner`, dropping the first `n` matching outbound datagrams.
    pub fn new(inner: D, n: u32, matches: fn(&[u8]) -> bool) -> Self {
        Self {
            inner,
            remaining: AtomicCell::new(n),
            matches,
        }
    }
}

#[async_trait]
impl<D: Datagram> Datagram for DropFirst<D> {
    async fn recv(&self) -> Result<(BytesMut, SocketAddr)> {
        self.inner.recv().await
    }

    async fn send(&self, buf: &[u8], dst: SocketAddr) -> Result<()> {
        if (self.matches)(buf) {
            loop {
                let remaining = self.remaining.load();
                if remaining == 0 {
                    break;
                }
                if self.remaining.compare_and_swap(remaining, remaining - 1) == remaining {
                    return Ok(());
                }
            }
        }
        self.inner.send(buf, dst).await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}
