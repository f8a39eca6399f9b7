//! Control messages and waiter templates.
use crate::segment::SegmentType;
use std::net::SocketAddr;

/// A protocol unit carrying only handshake or teardown signalling.
///
/// Unlike a [`crate::Segment`] this is not a wire format: it pairs the
/// decoded control fields with the network endpoints the unit travels
/// between, which the datagram layer supplies out of band.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ControlMessage {
    /// The control significance of the unit.
    pub ty: SegmentType,
    /// Endpoint the unit originates from.
    pub src: SocketAddr,
    /// Endpoint the unit is addressed to.
    pub dst: SocketAddr,
    /// Sequence number; meaningful for SYN, FIN and the final ACK.
    pub seq: u16,
    /// Acknowledgement number; meaningful for ACK, SYNACK and FINACK.
    pub ack: u16,
}

/// A waiter's expectation of a future control message.
///
/// Every field except the type is optional: `None` matches any value.
/// A server awaiting an opening SYN, for example, cannot know the
/// client's ephemeral source endpoint in advance and leaves it open.
/// Sequence and ack comparisons are exact, never ordered.
#[derive(Clone, Debug)]
pub struct Matcher {
    /// Required segment type.
    pub ty: SegmentType,
    /// Required source endpoint, if known.
    pub src: Option<SocketAddr>,
    /// Required destination endpoint, if known.
    pub dst: Option<SocketAddr>,
    /// Required sequence number, if known.
    pub seq: Option<u16>,
    /// Required acknowledgement number, if known.
    pub ack: Option<u16>,
}

impl Matcher {
    /// Creates a matcher constraining only the segment type.
    pub fn new(ty: SegmentType) -> Self {
        Self {
            ty,
            src: None,
            dst: None,
            seq: None,
            ack: None,
        }
    }

    /// True iff `msg` satisfies every constrained field.
    pub fn matches(&self, msg: &ControlMessage) -> bool {
        if self.ty != msg.ty {
            return false;
        }
        if self.src.map_or(false, |src| src != msg.src) {
            return false;
        }
        if self.dst.map_or(false, |dst| dst != msg.dst) {
            return false;
        }
        if self.seq.map_or(false, |seq| seq != msg.seq) {
            return false;
        }
        if self.ack.map_or(false, |ack| ack != msg.ack) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    fn msg() -> ControlMessage {
        ControlMessage {
            ty: SegmentType::SynAck,
            src: addr(80),
            dst: addr(9000),
            seq: 100,
            ack: 101,
        }
    }

    #[test]
    fn test_type_always_compared() {
        let matcher = Matcher::new(SegmentType::FinAck);
        assert!(!matcher.matches(&msg()));
        assert!(Matcher::new(SegmentType::SynAck).matches(&msg()));
    }

    #[test]
    fn test_wildcards_match_anything() {
        let matcher = Matcher::new(SegmentType::SynAck);
        assert!(matcher.matches(&msg()));
        let other = ControlMessage {
            seq: 9999,
            src: addr(8080),
            ..msg()
        };
        assert!(matcher.matches(&other));
    }

    #[test]
    fn test_constrained_fields_exact() {
        let mut matcher = Matcher::new(SegmentType::SynAck);
        matcher.ack = Some(101);
        matcher.src = Some(addr(80));
        assert!(matcher.matches(&msg()));
        matcher.ack = Some(102);
        assert!(!matcher.matches(&msg()));
    }

    #[test]
    fn test_zero_is_a_legitimate_value() {
        // zero is not a wildcard; only None is
        let mut matcher = Matcher::new(SegmentType::SynAck);
        matcher.seq = Some(0);
        assert!(!matcher.matches(&msg()));
        let zero_seq = ControlMessage { seq: 0, ..msg() };
        assert!(matcher.matches(&zero_seq));
    }
}
