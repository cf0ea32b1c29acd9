use anyhow::bail;
use num_enum::TryFromPrimitive;

use crate::frame::{Direction, Frame, FLOW_CONTROL_OPCODE};

/// Reason byte carried by every flow-control frame. NOP is the keepalive that an
///  idle link emits once per tick; the other reasons announce a locally detected
///  problem to the peer, which resets in response without re-announcing.
#[derive(TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowControlReason {
    Nop = 0,
    Overflow = 1,
    Corruption = 2,
    BadContent = 3,
}

/// Build a flow-control frame. Phase stamping happens later, at transmit time,
///  like for any other frame.
pub fn flow_control_frame(reason: FlowControlReason) -> Frame {
    Frame::new(FLOW_CONTROL_OPCODE, Direction::Request, &[reason as u8])
        .expect("a one-byte payload always fits")
}

/// Decode the reason of a validated flow-control frame. A malformed reason payload
///  is corruption, not a tolerable variant.
pub fn decode_reason(frame: &Frame) -> anyhow::Result<FlowControlReason> {
    if frame.opcode() != FLOW_CONTROL_OPCODE {
        bail!("not a flow-control frame: opcode {}", frame.opcode());
    }
    if frame.length() != 1 {
        bail!("flow-control frame with payload length {} instead of 1", frame.length());
    }
    Ok(FlowControlReason::try_from(frame.payload()[0])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nop(FlowControlReason::Nop)]
    #[case::overflow(FlowControlReason::Overflow)]
    #[case::corruption(FlowControlReason::Corruption)]
    #[case::bad_content(FlowControlReason::BadContent)]
    fn test_reason_round_trip(#[case] reason: FlowControlReason) {
        let frame = flow_control_frame(reason);

        assert_eq!(frame.opcode(), FLOW_CONTROL_OPCODE);
        assert_eq!(frame.length(), 1);
        assert!(!frame.more());
        frame.validate().unwrap();
        assert_eq!(decode_reason(&frame).unwrap(), reason);
    }

    #[test]
    fn test_decode_rejects_data_frame() {
        let frame = Frame::new(9, Direction::Request, &[0]).unwrap();
        assert!(decode_reason(&frame).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let frame = Frame::new(FLOW_CONTROL_OPCODE, Direction::Request, &[0, 0]).unwrap();
        assert!(decode_reason(&frame).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_reason() {
        let frame = Frame::new(FLOW_CONTROL_OPCODE, Direction::Request, &[17]).unwrap();
        assert!(decode_reason(&frame).is_err());
    }
}
