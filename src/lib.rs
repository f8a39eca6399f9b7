//! # TOU — a reliable, ordered, connection-oriented transport over datagrams
//!
//! Implements a TCP-like transport on top of an unreliable, unordered
//! datagram channel: three-way open handshake, mirrored teardown, 16-bit
//! sequence/acknowledgement numbering, continuous retransmission of every
//! unacknowledged unit, and opportunistic piggybacking of control flags
//! onto data segments.
//!
//! Each connection runs two long-lived tasks: an outbound dispatcher that
//! cycles the retransmission queues, and an inbound demultiplexer that
//! splits incoming datagrams into payload deliveries and control messages.
//! The calling task only ever blocks inside `connect`/`accept`/`close`
//! (waiting for the expected control message) and `read` (waiting for
//! payload).
//!
//! ## Examples
//!
//! ```no_run
//! # fn main() -> Result<(), failure::Error> { async_std::task::block_on(async {
//! #
//! use tou::TouSocket;
//!
//! let socket = TouSocket::bind("127.0.0.1:0".parse()?).await?;
//! let stream = socket.connect("127.0.0.1:7000".parse()?).await?;
//! stream.write(b"ping").await?;
//! let reply = stream.read().await?;
//! stream.close().await?;
//! socket.close().await?;
//! #
//! # Ok(()) }) }
//! ```
//! ```no_run
//! # fn main() -> Result<(), failure::Error> { async_std::task::block_on(async {
//! #
//! use tou::TouSocket;
//!
//! let socket = TouSocket::bind("127.0.0.1:7000".parse()?).await?;
//! socket.listen()?;
//! let stream = socket.accept().await?;
//! while let Some(payload) = stream.read().await? {
//!     stream.write(&payload).await?;
//! }
//! stream.close().await?;
//! #
//! # Ok(()) }) }
//! ```
mod connection;
mod error;
pub mod factory;
mod message;
mod receiver;
mod segment;
mod sender;
mod udp;

pub use crate::connection::ConnState;
pub use crate::error::{Error, Result};
pub use crate::message::{ControlMessage, Matcher};
pub use crate::segment::{seq_add, Segment, SegmentType, HEADER_LEN};
pub use crate::udp::Udp;
pub use channel::Datagram;

use crate::connection::{transition, Core};
use bytes::BytesMut;
use crossbeam::atomic::AtomicCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs for a connection.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) queue_capacity: usize,
    pub(crate) pending_capacity: usize,
    pub(crate) rtx: Duration,
    pub(crate) handshake: Option<Duration>,
    pub(crate) close: Duration,
}

impl Config {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            queue_capacity: 64,
            pending_capacity: 64,
            rtx: Duration::from_millis(0),
            handshake: Some(Duration::from_secs(10)),
            close: Duration::from_secs(3),
        }
    }

    /// Capacity of each retransmission queue. Enqueueing into a full queue
    /// waits; this is the transport's only backpressure mechanism.
    pub fn set_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Capacity of the set of control messages held for late waiters.
    /// Under pressure the oldest parked message is discarded.
    pub fn set_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Minimum pause before a queued unit is retransmitted.
    ///
    /// The default of zero resends every pending unit on every dispatcher
    /// pass, the reference behavior; raising it trades time-to-delivery
    /// under loss for a quieter channel.
    pub fn set_rtx(mut self, rtx: Duration) -> Self {
        self.rtx = rtx;
        self
    }

    /// Bound on a blocked `connect`/`accept` handshake step, after which
    /// the call fails with [`Error::Cancelled`]. `None` waits forever.
    pub fn set_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake = timeout;
        self
    }

    /// Bound on `close`: draining in-flight sends and waiting for the
    /// teardown's final ACK both give up at this deadline.
    pub fn set_close_timeout(mut self, timeout: Duration) -> Self {
        self.close = timeout;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// A TOU socket: one connection manager bound to a local endpoint.
///
/// Created in the bound state. From there it either actively opens a
/// connection with [`TouSocket::connect`] or passively accepts them after
/// [`TouSocket::listen`]. Every call checks the state machine and fails
/// with [`Error::InvalidState`] when issued out of order.
pub struct TouSocket<D: Datagram = Udp> {
    core: Arc<Core<D>>,
    state: Arc<AtomicCell<ConnState>>,
    remote: AtomicCell<Option<SocketAddr>>,
}

impl TouSocket<Udp> {
    /// Binds a socket to `addr` over UDP.
    ///
    /// ## Examples
    ///
    /// ```no_run
    /// # fn main() -> Result<(), failure::Error> { async_std::task::block_on(async {
    /// #
    /// use tou::TouSocket;
    ///
    /// let socket = TouSocket::bind("127.0.0.1:0".parse()?).await?;
    /// socket.local_addr();
    /// #
    /// # Ok(()) }) }
    /// ```
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let channel = Udp::bind(addr).await?;
        Self::from_channel(channel, Config::new())
    }
}

impl<D: Datagram + 'static> TouSocket<D> {
    /// Binds a socket over an arbitrary datagram channel.
    pub fn from_channel(channel: D, config: Config) -> Result<Self> {
        let core = Core::new(channel, config)?;
        Ok(Self {
            core,
            state: Arc::new(AtomicCell::new(ConnState::Bound)),
            remote: AtomicCell::new(None),
        })
    }

    /// Returns the local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    /// Starts accepting incoming connections.
    pub fn listen(&self) -> Result<()> {
        transition(&self.state, ConnState::Bound, ConnState::Listen)
    }

    /// Actively opens a connection to `remote`.
    ///
    /// Blocks until the handshake completes. A second `connect` without an
    /// intervening `close` fails with [`Error::InvalidState`]; a cancelled
    /// attempt returns the socket to the bound state so it can be retried.
    pub async fn connect(&self, remote: SocketAddr) -> Result<TouStream<D>> {
        transition(&self.state, ConnState::Bound, ConnState::SynSent)?;
        match self.core.open_active(remote).await {
            Ok(next_seq) => {
                self.state.store(ConnState::Established);
                self.remote.store(Some(remote));
                Ok(TouStream {
                    core: self.core.clone(),
                    remote,
                    state: self.state.clone(),
                    next_seq: AtomicCell::new(next_seq),
                })
            }
            Err(err) => {
                self.state.store(ConnState::Bound);
                Err(err)
            }
        }
    }

    /// Accepts one incoming connection.
    ///
    /// Blocks until a SYN arrives and its handshake completes, then returns
    /// the stream for that peer. The socket keeps listening; `accept` may
    /// be called again for further peers.
    pub async fn accept(&self) -> Result<TouStream<D>> {
        let found = self.state.load();
        if found != ConnState::Listen {
            return Err(Error::InvalidState {
                expected: ConnState::Listen,
                found,
            });
        }
        let stream_state = Arc::new(AtomicCell::new(ConnState::Listen));
        let (remote, next_seq) = self.core.open_passive(&stream_state).await?;
        stream_state.store(ConnState::Established);
        Ok(TouStream {
            core: self.core.clone(),
            remote,
            state: stream_state,
            next_seq: AtomicCell::new(next_seq),
        })
    }

    /// Closes the socket.
    ///
    /// An established connection runs the FIN exchange first; in every case
    /// both worker tasks stop and the channel is released. Closing an
    /// already closed socket is a no-op.
    pub async fn close(&self) -> Result<()> {
        let result = match self.state.load() {
            ConnState::Established => match self.remote.load() {
                Some(remote)
                    if transition(&self.state, ConnState::Established, ConnState::FinSent)
                        .is_ok() =>
                {
                    self.core.teardown(remote, &self.state).await
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        };
        self.core.stop().await;
        self.state.store(ConnState::Closed);
        result
    }
}

/// One established connection to a remote peer.
///
/// Returned by [`TouSocket::connect`] and [`TouSocket::accept`]. Writes
/// return once the segment is queued for (re)transmission, not once it is
/// delivered; reads yield payloads in receipt order and `None` after the
/// peer has closed.
pub struct TouStream<D: Datagram = Udp> {
    core: Arc<Core<D>>,
    remote: SocketAddr,
    state: Arc<AtomicCell<ConnState>>,
    next_seq: AtomicCell<u16>,
}

impl<D: Datagram + 'static> TouStream<D> {
    /// Returns the peer endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Returns the local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    /// Queues `payload` as one data segment.
    ///
    /// Sequence numbers increase by one per call, wrapping at 2^16. The
    /// segment stays queued, retransmitted continuously, until the peer's
    /// ACK for it is observed. Blocks while the queue is full.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let found = self.state.load();
        if found != ConnState::Established {
            return Err(Error::InvalidState {
                expected: ConnState::Established,
                found,
            });
        }
        let seq = self.next_seq.fetch_add(1);
        let segment = factory::data_segment(seq, self.core.local, self.remote, payload);
        self.core.sender.put_data(segment, self.remote).await
    }

    /// Blocks until one payload delivery from the peer is available.
    ///
    /// Deliveries arrive in receipt order, which equals send order only as
    /// far as the datagram layer preserves it. Returns `None` once the
    /// peer has closed and the inbox is drained.
    pub async fn read(&self) -> Result<Option<BytesMut>> {
        self.core.receiver.read(self.remote, None).await
    }

    /// Number of queued data segments not yet acknowledged by the peer.
    pub fn in_flight(&self) -> usize {
        self.core.sender.data_in_flight(self.remote)
    }

    /// Closes the connection with the FIN exchange.
    ///
    /// New writes are refused as soon as teardown starts; queued segments
    /// drain best-effort within the close timeout. Closing an already
    /// closed stream is a no-op. The shared socket (and its worker tasks)
    /// stays usable for other streams; closing it is the owner's call.
    pub async fn close(&self) -> Result<()> {
        match self.state.load() {
            ConnState::Closed => return Ok(()),
            ConnState::Established => {}
            found => {
                return Err(Error::InvalidState {
                    expected: ConnState::Established,
                    found,
                })
            }
        }
        if transition(&self.state, ConnState::Established, ConnState::FinSent).is_err() {
            // someone else is already tearing the stream down
            return Ok(());
        }
        self.core.teardown(self.remote, &self.state).await
    }
}
