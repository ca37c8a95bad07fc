//! The two-party exchange variants
//!
//! Each variant uses its own set of frame codes, so the code of a received
//! frame tells both the variant and the step of the exchange.

use crate::frame::{ExtPayload, FrameCode, TwrKind};


/// A two-party ranging variant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Request, reply, final; the opener computes from the reply
    SingleSided,
    /// Like `SingleSided`, the replier first acknowledges the request and
    /// the acknowledgement is the timed reply
    SingleSidedAck,
    /// Like `SingleSided`, the final carries an [`ExtPayload`]
    SingleSidedExt,
    /// Request, reply, second request, final; both legs are combined
    DoubleSided,
    /// Like `DoubleSided`, the second request and the final carry an
    /// [`ExtPayload`]
    DoubleSidedExt,
}

/// A step of a two-party exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Sent by the initiator
    Request,
    /// Sent by the responder
    T1,
    /// Sent by the initiator, double-sided only
    T2,
    /// Sent by the initiator (single-sided) or the responder (double-sided)
    Final,
}

impl Variant {
    /// All variants
    pub const ALL: [Variant; 5] = [
        Variant::SingleSided,
        Variant::SingleSidedAck,
        Variant::SingleSidedExt,
        Variant::DoubleSided,
        Variant::DoubleSidedExt,
    ];

    /// Returns `true` for the double-sided variants
    pub fn is_double_sided(&self) -> bool {
        matches!(self, Variant::DoubleSided | Variant::DoubleSidedExt)
    }

    /// Returns `true` for the variants that exchange an [`ExtPayload`]
    pub fn is_extended(&self) -> bool {
        matches!(self, Variant::SingleSidedExt | Variant::DoubleSidedExt)
    }

    /// The code of `step`, `None` if the variant has no such step
    pub fn code(&self, step: Step) -> Option<FrameCode> {
        use FrameCode::*;

        let codes = match self {
            Variant::SingleSided => [SsRequest, SsT1, SsT1, SsFinal],
            Variant::SingleSidedAck => [SsAckRequest, SsAckT1, SsAckT1, SsAckFinal],
            Variant::SingleSidedExt => [SsExtRequest, SsExtT1, SsExtT1, SsExtFinal],
            Variant::DoubleSided => [DsRequest, DsT1, DsT2, DsFinal],
            Variant::DoubleSidedExt => [DsExtRequest, DsExtT1, DsExtT2, DsExtFinal],
        };
        match step {
            Step::Request => Some(codes[0]),
            Step::T1 => Some(codes[1]),
            Step::T2 if self.is_double_sided() => Some(codes[2]),
            Step::T2 => None,
            Step::Final => Some(codes[3]),
        }
    }

    /// How much of the frame `step` sends
    pub fn kind(&self, step: Step) -> TwrKind {
        match step {
            Step::Request => TwrKind::Request,
            Step::T1 => TwrKind::Response,
            Step::T2 | Step::Final if self.is_extended() => TwrKind::FinalExt,
            Step::T2 | Step::Final => TwrKind::Final,
        }
    }

    /// The variant and step a code belongs to
    pub fn from_code(code: FrameCode) -> Option<(Variant, Step)> {
        Variant::ALL.iter().find_map(|&variant| {
            [Step::Request, Step::T1, Step::T2, Step::Final]
                .iter()
                .find(|&&step| variant.code(step) == Some(code))
                .map(|&step| (variant, step))
        })
    }
}


/// Outcome of a completed two-party exchange
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeResult {
    /// The variant used
    pub variant: Variant,
    /// `true` if this node opened the exchange
    pub initiator: bool,
    /// Short address of the other node
    pub peer: u16,
    /// Sequence number of the exchange
    pub seq_num: u8,
    /// Time of flight in DTU
    pub tof: f64,
    /// Range in meters, bias corrected if so configured
    pub range: f64,
    /// Receive power of the last frame, if it could be estimated
    pub rssi: Option<f32>,
    /// The other node's extension, for the extended variants
    pub ext: Option<ExtPayload>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_back_to_their_step() {
        for variant in Variant::ALL.iter() {
            for step in [Step::Request, Step::T1, Step::T2, Step::Final].iter() {
                if let Some(code) = variant.code(*step) {
                    assert_eq!(Variant::from_code(code), Some((*variant, *step)));
                }
            }
        }
    }

    #[test]
    fn single_sided_has_no_second_request() {
        assert_eq!(Variant::SingleSided.code(Step::T2), None);
        assert_eq!(Variant::DoubleSided.code(Step::T2), Some(FrameCode::DsT2));
    }

    #[test]
    fn extended_finals_carry_the_payload() {
        assert_eq!(Variant::DoubleSidedExt.kind(Step::T2), TwrKind::FinalExt);
        assert_eq!(Variant::SingleSidedExt.kind(Step::Final), TwrKind::FinalExt);
        assert_eq!(Variant::SingleSidedExt.kind(Step::T1), TwrKind::Response);
        assert_eq!(Variant::DoubleSided.kind(Step::Final), TwrKind::Final);
    }

    #[test]
    fn foreign_codes_are_not_variants() {
        assert_eq!(Variant::from_code(FrameCode::Ccp), None);
        assert_eq!(Variant::from_code(FrameCode::SsNrngRequest), None);
    }
}
