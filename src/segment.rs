//! Defines the segment wire format.
//!
//! A segment is the raw binary unit exchanged between peers, one per
//! datagram. All multi-byte fields are big-endian:
//!
//! ```text
//! +--------+--------+--------+--------+--------+
//! | flags  |   sequence num  |    ack num      |
//! +--------+--------+--------+--------+--------+
//! |   source port   | destination port| offset |
//! +--------+--------+--------+--------+--------+
//! |                payload ...                 |
//! +--------------------------------------------+
//! ```
//!
//! `offset` holds the header length and marks where the payload begins.
use crate::error::Error;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

/// Synchronise sequence numbers (handshake initiation).
const SYN: u8 = 0b0000_0001;
/// Acknowledgement field is valid.
const ACK: u8 = 0b0000_0010;
/// Finish, the sender has no more data to send.
const FIN: u8 = 0b0000_0100;

/// Byte length of the fixed header on the wire.
pub const HEADER_LEN: usize = 10;

const OFF_FLAGS: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_ACK: usize = 3;
const OFF_SRC_PORT: usize = 5;
const OFF_DST_PORT: usize = 7;
const OFF_DATA_OFFSET: usize = 9;

/// Advances a 16-bit sequence number, wrapping at 2^16.
pub fn seq_add(seq: u16, n: u16) -> u16 {
    seq.wrapping_add(n)
}

/// The decoded meaning of the flags byte.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SegmentType {
    /// Plain data, no control significance.
    Ordinary,
    /// Active open request.
    Syn,
    /// Acknowledgement.
    Ack,
    /// Teardown request.
    Fin,
    /// Reply to a SYN.
    SynAck,
    /// Reply to a FIN.
    FinAck,
}

impl SegmentType {
    /// Encodes the type as a flags byte.
    pub fn to_byte(self) -> u8 {
        match self {
            SegmentType::Ordinary => 0,
            SegmentType::Syn => SYN,
            SegmentType::Ack => ACK,
            SegmentType::Fin => FIN,
            SegmentType::SynAck => SYN | ACK,
            SegmentType::FinAck => FIN | ACK,
        }
    }

    /// Decodes a flags byte.
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(SegmentType::Ordinary),
            b if b == SYN => Ok(SegmentType::Syn),
            b if b == ACK => Ok(SegmentType::Ack),
            b if b == FIN => Ok(SegmentType::Fin),
            b if b == SYN | ACK => Ok(SegmentType::SynAck),
            b if b == FIN | ACK => Ok(SegmentType::FinAck),
            other => Err(Error::UnknownSegmentType(other)),
        }
    }

    /// True for the types whose ack number is semantically meaningful.
    pub fn is_ack(self) -> bool {
        match self {
            SegmentType::Ack | SegmentType::SynAck | SegmentType::FinAck => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SegmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            SegmentType::Ordinary => "ORDINARY",
            SegmentType::Syn => "SYN",
            SegmentType::Ack => "ACK",
            SegmentType::Fin => "FIN",
            SegmentType::SynAck => "SYNACK",
            SegmentType::FinAck => "FINACK",
        };
        write!(f, "{}", name)
    }
}

/// A complete wire segment: fixed header plus payload.
#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    bytes: BytesMut,
}

impl Segment {
    /// Creates a zeroed segment with room for `payload_len` payload bytes.
    pub fn new(payload_len: usize) -> Self {
        let mut bytes = BytesMut::with_capacity(HEADER_LEN + payload_len);
        bytes.put_slice(&[0u8; HEADER_LEN]);
        bytes[OFF_DATA_OFFSET] = HEADER_LEN as u8;
        Self { bytes }
    }

    /// Parses a raw datagram into a segment.
    ///
    /// Rejects truncated buffers, a data offset disagreeing with
    /// [`HEADER_LEN`], and flags that do not decode to a known type.
    pub fn parse(bytes: BytesMut) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated segment",
            )));
        }
        if bytes[OFF_DATA_OFFSET] as usize != HEADER_LEN {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad data offset",
            )));
        }
        SegmentType::from_byte(bytes[OFF_FLAGS])?;
        Ok(Self { bytes })
    }

    /// Returns the raw flags byte.
    pub fn flags(&self) -> u8 {
        self.bytes[OFF_FLAGS]
    }

    /// Returns the decoded segment type.
    pub fn ty(&self) -> SegmentType {
        // parse() and set_ty() only admit known flag patterns
        SegmentType::from_byte(self.flags()).unwrap_or(SegmentType::Ordinary)
    }

    /// Overwrites the flags byte.
    pub fn set_ty(&mut self, ty: SegmentType) {
        self.bytes[OFF_FLAGS] = ty.to_byte();
    }

    /// Returns the sequence number.
    pub fn seq_num(&self) -> u16 {
        BigEndian::read_u16(&self.bytes[OFF_SEQ..OFF_SEQ + 2])
    }

    /// Sets the sequence number.
    pub fn set_seq_num(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.bytes[OFF_SEQ..OFF_SEQ + 2], seq)
    }

    /// Returns the acknowledgement number.
    pub fn ack_num(&self) -> u16 {
        BigEndian::read_u16(&self.bytes[OFF_ACK..OFF_ACK + 2])
    }

    /// Sets the acknowledgement number.
    pub fn set_ack_num(&mut self, ack: u16) {
        BigEndian::write_u16(&mut self.bytes[OFF_ACK..OFF_ACK + 2], ack)
    }

    /// Returns the source port.
    pub fn src_port(&self) -> u16 {
        BigEndian::read_u16(&self.bytes[OFF_SRC_PORT..OFF_SRC_PORT + 2])
    }

    /// Sets the source port.
    pub fn set_src_port(&mut self, port: u16) {
        BigEndian::write_u16(&mut self.bytes[OFF_SRC_PORT..OFF_SRC_PORT + 2], port)
    }

    /// Returns the destination port.
    pub fn dst_port(&self) -> u16 {
        BigEndian::read_u16(&self.bytes[OFF_DST_PORT..OFF_DST_PORT + 2])
    }

    /// Sets the destination port.
    pub fn set_dst_port(&mut self, port: u16) {
        BigEndian::write_u16(&mut self.bytes[OFF_DST_PORT..OFF_DST_PORT + 2], port)
    }

    /// Returns the payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// Appends payload bytes.
    pub fn put_payload(&mut self, payload: &[u8]) {
        self.bytes.put_slice(payload)
    }

    /// Returns the full wire representation.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<&[u8]> for Segment {
    fn from(payload: &[u8]) -> Self {
        let mut segment = Self::new(payload.len());
        segment.put_payload(payload);
        segment
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("type", &self.ty())
            .field("seq", &self.seq_num())
            .field("ack", &self.ack_num())
            .field("src_port", &self.src_port())
            .field("dst_port", &self.dst_port())
            .field("payload", &self.payload().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut segment = Segment::from(&b"hello"[..]);
        segment.set_ty(SegmentType::SynAck);
        segment.set_seq_num(42);
        segment.set_ack_num(7);
        segment.set_src_port(1000);
        segment.set_dst_port(2000);

        let parsed = Segment::parse(BytesMut::from(segment.bytes())).unwrap();
        assert_eq!(parsed.ty(), SegmentType::SynAck);
        assert_eq!(parsed.seq_num(), 42);
        assert_eq!(parsed.ack_num(), 7);
        assert_eq!(parsed.src_port(), 1000);
        assert_eq!(parsed.dst_port(), 2000);
        assert_eq!(parsed.payload(), b"hello");
    }

    #[test]
    fn test_big_endian_layout() {
        let mut segment = Segment::new(0);
        segment.set_seq_num(0x0102);
        segment.set_ack_num(0x0304);
        segment.set_src_port(0x0506);
        segment.set_dst_port(0x0708);
        let bytes = segment.bytes();
        assert_eq!(&bytes[1..9], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(bytes[9], HEADER_LEN as u8);
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(Segment::parse(BytesMut::from(&[0u8; HEADER_LEN - 1][..])).is_err());
        assert!(Segment::parse(BytesMut::new()).is_err());
    }

    #[test]
    fn test_bad_data_offset_rejected() {
        let mut segment = Segment::new(0);
        let mut raw = BytesMut::from(segment.bytes());
        raw[OFF_DATA_OFFSET] = 3;
        assert!(Segment::parse(raw).is_err());
        segment.set_seq_num(1);
        assert!(Segment::parse(BytesMut::from(segment.bytes())).is_ok());
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut raw = BytesMut::from(Segment::new(0).bytes());
        raw[OFF_FLAGS] = 0b1000_0000;
        match Segment::parse(raw) {
            Err(Error::UnknownSegmentType(0b1000_0000)) => {}
            other => panic!("expected unknown segment type, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_flag_bit_patterns() {
        assert_eq!(SegmentType::Ordinary.to_byte(), 0);
        assert_eq!(
            SegmentType::SynAck.to_byte(),
            SegmentType::Syn.to_byte() | SegmentType::Ack.to_byte()
        );
        assert_eq!(
            SegmentType::FinAck.to_byte(),
            SegmentType::Fin.to_byte() | SegmentType::Ack.to_byte()
        );
        for ty in &[
            SegmentType::Ordinary,
            SegmentType::Syn,
            SegmentType::Ack,
            SegmentType::Fin,
            SegmentType::SynAck,
            SegmentType::FinAck,
        ] {
            assert_eq!(SegmentType::from_byte(ty.to_byte()).unwrap(), *ty);
        }
    }

    #[test]
    fn test_seq_add_wraps() {
        assert_eq!(seq_add(65535, 1), 0);
        assert_eq!(seq_add(65534, 3), 1);
        assert_eq!(seq_add(0, 1), 1);
    }
}
