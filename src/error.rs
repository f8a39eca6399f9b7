use crate::connection::ConnState;
use failure::Fail;

/// Errors surfaced by the TOU transport.
#[derive(Debug, Fail)]
pub enum Error {
    /// An API call was issued from a state that forbids it. Fatal to that
    /// call only; the connection is otherwise unaffected.
    #[fail(display = "invalid state: expected {}, found {}", expected, found)]
    InvalidState {
        /// The state the call requires.
        expected: ConnState,
        /// The state the connection was actually in.
        found: ConnState,
    },
    /// The flags byte of a datagram does not decode to a known segment type.
    /// The offending datagram is dropped; the connection survives.
    #[fail(display = "unknown segment type {:#04x}", _0)]
    UnknownSegmentType(u8),
    /// A blocked handshake or teardown call was interrupted before its
    /// expected control message arrived. The caller may retry or abandon.
    #[fail(display = "operation cancelled")]
    Cancelled,
    /// The underlying datagram transport failed or was closed. Fatal:
    /// propagates to all blocked callers and stops both worker tasks.
    #[fail(display = "datagram channel closed")]
    ChannelClosed,
    /// An I/O error from the datagram transport.
    #[fail(display = "{}", _0)]
    Io(#[cause] std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
