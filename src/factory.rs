//! Pure construction and derivation of protocol units.
//!
//! Everything here is side-effect free: building handshake and teardown
//! messages, deriving the matcher a waiter blocks on, translating between
//! control messages and wire segments, and the merge/unmerge of a control
//! message into a data segment.
//!
//! The handshake arithmetic, for an initiator sequence number A and a
//! responder sequence number B, is:
//!
//! * SYN/FIN carry `seq = A`, `ack = 0`
//! * SYNACK/FINACK carry `seq = B`, `ack = A + 1`
//! * the final ACK carries `seq = A + 1`, `ack = B + 1`
//!
//! with all additions modulo 2^16.
use crate::error::Result;
use crate::message::{ControlMessage, Matcher};
use crate::segment::{seq_add, Segment, SegmentType};
use std::net::SocketAddr;

fn isn() -> u16 {
    rand::random()
}

/// Builds a SYN or FIN with a fresh random sequence number and zero ack.
pub fn open_or_close(ty: SegmentType, src: SocketAddr, dst: SocketAddr) -> ControlMessage {
    debug_assert!(ty == SegmentType::Syn || ty == SegmentType::Fin);
    ControlMessage {
        ty,
        src,
        dst,
        seq: isn(),
        ack: 0,
    }
}

/// Builds the SYNACK or FINACK answering `request`, sourced at `local`.
pub fn reply(local: SocketAddr, request: &ControlMessage) -> ControlMessage {
    let ty = match request.ty {
        SegmentType::Syn => SegmentType::SynAck,
        _ => SegmentType::FinAck,
    };
    ControlMessage {
        ty,
        src: local,
        dst: request.src,
        seq: isn(),
        ack: seq_add(request.seq, 1),
    }
}

/// Builds the closing ACK answering a SYNACK or FINACK.
pub fn final_ack(reply: &ControlMessage) -> ControlMessage {
    ControlMessage {
        ty: SegmentType::Ack,
        src: reply.dst,
        dst: reply.src,
        seq: reply.ack,
        ack: seq_add(reply.seq, 1),
    }
}

/// Builds the one-shot ACK for a received ordinary data segment.
pub fn data_ack(seq: u16, local: SocketAddr, remote: SocketAddr) -> ControlMessage {
    ControlMessage {
        ty: SegmentType::Ack,
        src: local,
        dst: remote,
        seq: 0,
        ack: seq,
    }
}

/// Matcher for an opening SYN or closing FIN addressed to `local`.
///
/// The source endpoint and sequence number are unknown to the waiter in
/// advance and left wild.
pub fn open_matcher(ty: SegmentType, local: SocketAddr) -> Matcher {
    debug_assert!(ty == SegmentType::Syn || ty == SegmentType::Fin);
    let mut matcher = Matcher::new(ty);
    matcher.dst = Some(local);
    matcher
}

/// Matcher for the SYNACK or FINACK answering the `request` we sent.
pub fn reply_matcher(request: &ControlMessage) -> Matcher {
    let ty = match request.ty {
        SegmentType::Syn => SegmentType::SynAck,
        _ => SegmentType::FinAck,
    };
    let mut matcher = Matcher::new(ty);
    matcher.src = Some(request.dst);
    matcher.dst = Some(request.src);
    matcher.ack = Some(seq_add(request.seq, 1));
    matcher
}

/// Matcher for the final ACK answering the `reply` we sent to `request`.
pub fn final_ack_matcher(request: &ControlMessage, reply: &ControlMessage) -> Matcher {
    let mut matcher = Matcher::new(SegmentType::Ack);
    matcher.src = Some(request.src);
    matcher.dst = Some(request.dst);
    matcher.seq = Some(reply.ack);
    matcher.ack = Some(seq_add(reply.seq, 1));
    matcher
}

/// Encodes a control message as a payload-free wire segment.
pub fn control_segment(msg: &ControlMessage) -> Segment {
    let mut segment = Segment::new(0);
    segment.set_ty(msg.ty);
    segment.set_seq_num(msg.seq);
    segment.set_ack_num(msg.ack);
    segment.set_src_port(msg.src.port());
    segment.set_dst_port(msg.dst.port());
    segment
}

/// Builds an ordinary data segment carrying `payload`.
pub fn data_segment(seq: u16, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Segment {
    let mut segment = Segment::from(payload);
    segment.set_seq_num(seq);
    segment.set_src_port(src.port());
    segment.set_dst_port(dst.port());
    segment
}

/// Derives the control message carried by a segment.
///
/// For a pure control segment this is the whole unit; for a data segment
/// merged with a control message it is the piggybacked part.
pub fn split_control(segment: &Segment, src: SocketAddr, dst: SocketAddr) -> Result<ControlMessage> {
    let ty = SegmentType::from_byte(segment.flags())?;
    Ok(ControlMessage {
        ty,
        src,
        dst,
        seq: segment.seq_num(),
        ack: segment.ack_num(),
    })
}

/// True iff `msg` may piggyback on the data segment.
///
/// The segment must carry no control flags yet and be addressed to the
/// same endpoint; SYN/FIN/SYNACK/FINACK additionally require the segment's
/// sequence number to equal the message's correlating sequence number.
pub fn can_merge(segment: &Segment, segment_dst: SocketAddr, msg: &ControlMessage) -> bool {
    if segment.flags() != 0 {
        return false;
    }
    if segment_dst != msg.dst {
        return false;
    }
    match msg.ty {
        SegmentType::Ack => true,
        SegmentType::Syn
        | SegmentType::Fin
        | SegmentType::SynAck
        | SegmentType::FinAck => segment.seq_num() == msg.seq,
        SegmentType::Ordinary => false,
    }
}

/// Splices `msg`'s flags and ack number onto the data segment.
pub fn merge(segment: &mut Segment, msg: &ControlMessage) {
    segment.set_ty(msg.ty);
    segment.set_ack_num(msg.ack);
}

/// Reverses a [`merge`], restoring the segment to an ordinary one.
pub fn unmerge(segment: &mut Segment) {
    segment.set_ty(SegmentType::Ordinary);
    segment.set_ack_num(0);
}

/// True iff the data segment currently carries `msg` piggybacked.
pub fn is_merged_with(segment: &Segment, msg: &ControlMessage) -> bool {
    if segment.flags() != msg.ty.to_byte() {
        return false;
    }
    match msg.ty {
        SegmentType::Ack => segment.ack_num() == msg.ack,
        SegmentType::Syn | SegmentType::Fin => segment.seq_num() == msg.seq,
        SegmentType::SynAck | SegmentType::FinAck => {
            segment.seq_num() == msg.seq && segment.ack_num() == msg.ack
        }
        SegmentType::Ordinary => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.0.1:{}", port).parse().unwrap()
    }

    fn syn(seq: u16) -> ControlMessage {
        ControlMessage {
            ty: SegmentType::Syn,
            src: addr(9000),
            dst: addr(80),
            seq,
            ack: 0,
        }
    }

    #[test]
    fn test_open_or_close_shape() {
        let msg = open_or_close(SegmentType::Syn, addr(1), addr(2));
        assert_eq!(msg.ty, SegmentType::Syn);
        assert_eq!(msg.src, addr(1));
        assert_eq!(msg.dst, addr(2));
        assert_eq!(msg.ack, 0);
    }

    #[test]
    fn test_reply_arithmetic() {
        let synack = reply(addr(80), &syn(100));
        assert_eq!(synack.ty, SegmentType::SynAck);
        assert_eq!(synack.src, addr(80));
        assert_eq!(synack.dst, addr(9000));
        assert_eq!(synack.ack, 101);
    }

    #[test]
    fn test_reply_arithmetic_wraps() {
        let synack = reply(addr(80), &syn(65535));
        assert_eq!(synack.ack, 0);
    }

    #[test]
    fn test_final_ack_arithmetic() {
        let mut synack = reply(addr(80), &syn(100));
        synack.seq = 500; // pin the random responder sequence number
        let ack = final_ack(&synack);
        assert_eq!(ack.ty, SegmentType::Ack);
        assert_eq!(ack.src, addr(9000));
        assert_eq!(ack.dst, addr(80));
        assert_eq!(ack.seq, 101); // A + 1
        assert_eq!(ack.ack, 501); // B + 1
    }

    #[test]
    fn test_final_ack_arithmetic_wraps() {
        let mut synack = reply(addr(80), &syn(10));
        synack.seq = 65535;
        assert_eq!(final_ack(&synack).ack, 0);
    }

    #[test]
    fn test_reply_matcher_expects_counterpart() {
        let request = syn(65535);
        let matcher = reply_matcher(&request);
        assert!(matcher.matches(&reply(addr(80), &request)));
        // a reply to some other request must not match
        assert!(!matcher.matches(&reply(addr(80), &syn(7))));
    }

    #[test]
    fn test_final_ack_matcher_expects_exact_numbers() {
        let request = syn(100);
        let mut synack = reply(addr(80), &request);
        synack.seq = 200;
        let matcher = final_ack_matcher(&request, &synack);
        assert!(matcher.matches(&final_ack(&synack)));
        let mut stale = final_ack(&synack);
        stale.ack = 9;
        assert!(!matcher.matches(&stale));
    }

    #[test]
    fn test_open_matcher_wildcards_source() {
        let matcher = open_matcher(SegmentType::Syn, addr(80));
        assert!(matcher.matches(&syn(1)));
        let from_elsewhere = ControlMessage {
            src: addr(12345),
            ..syn(1)
        };
        assert!(matcher.matches(&from_elsewhere));
    }

    #[test]
    fn test_control_segment_roundtrip() {
        let msg = syn(321);
        let segment = control_segment(&msg);
        assert_eq!(segment.src_port(), 9000);
        assert_eq!(segment.dst_port(), 80);
        assert!(segment.payload().is_empty());
        let derived = split_control(&segment, msg.src, msg.dst).unwrap();
        assert_eq!(derived, msg);
    }

    #[test]
    fn test_merge_unmerge_restores_segment() {
        let mut segment = data_segment(77, addr(9000), addr(80), b"payload");
        let before = segment.bytes().to_vec();
        let ack = data_ack(77, addr(9000), addr(80));
        assert!(can_merge(&segment, addr(80), &ack));
        merge(&mut segment, &ack);
        assert_eq!(segment.ty(), SegmentType::Ack);
        assert_eq!(segment.ack_num(), 77);
        assert!(is_merged_with(&segment, &ack));
        unmerge(&mut segment);
        assert_eq!(segment.ty(), SegmentType::Ordinary);
        assert_eq!(segment.ack_num(), 0);
        assert_eq!(segment.bytes(), &before[..]);
    }

    #[test]
    fn test_unmerge_restores_for_every_control_type() {
        for ty in &[
            SegmentType::Syn,
            SegmentType::Ack,
            SegmentType::Fin,
            SegmentType::SynAck,
            SegmentType::FinAck,
        ] {
            let mut segment = data_segment(77, addr(9000), addr(80), b"payload");
            let before = segment.bytes().to_vec();
            let msg = ControlMessage {
                ty: *ty,
                src: addr(9000),
                dst: addr(80),
                seq: 77,
                ack: 78,
            };
            assert!(can_merge(&segment, addr(80), &msg), "{}", ty);
            merge(&mut segment, &msg);
            assert!(is_merged_with(&segment, &msg), "{}", ty);
            unmerge(&mut segment);
            assert_eq!(segment.bytes(), &before[..], "{}", ty);
        }
    }

    #[test]
    fn test_cannot_merge_twice() {
        let mut segment = data_segment(77, addr(9000), addr(80), b"x");
        let ack = data_ack(5, addr(9000), addr(80));
        merge(&mut segment, &ack);
        assert!(!can_merge(&segment, addr(80), &ack));
    }

    #[test]
    fn test_cannot_merge_across_destinations() {
        let segment = data_segment(77, addr(9000), addr(80), b"x");
        let ack = data_ack(5, addr(9000), addr(81));
        assert!(!can_merge(&segment, addr(80), &ack));
    }

    #[test]
    fn test_syn_merge_requires_correlated_seq() {
        let segment = data_segment(77, addr(9000), addr(80), b"x");
        let mut msg = syn(77);
        assert!(can_merge(&segment, addr(80), &msg));
        msg.seq = 78;
        assert!(!can_merge(&segment, addr(80), &msg));
    }

    #[test]
    fn test_split_control_from_merged_segment() {
        let mut segment = data_segment(77, addr(9000), addr(80), b"data");
        let ack = data_ack(42, addr(9000), addr(80));
        merge(&mut segment, &ack);
        let derived = split_control(&segment, addr(9000), addr(80)).unwrap();
        assert_eq!(derived.ty, SegmentType::Ack);
        assert_eq!(derived.ack, 42);
    }
}
