//! Wire formats of all frames
//!
//! Every frame begins with its frame control field, which together with the
//! `code` field tells the services on a device whose frame it is. Frames are
//! little-endian, packed and sized exactly; a frame whose length doesn't match
//! what its code calls for belongs to someone else and decodes to `None`.
//!
//! Two kinds of frames are used:
//! - 16-bit addressed data frames (`fctrl` 0x8841) with a [`FrameHeader`]
//! - blink frames (`fctrl` 0xC5) carrying the sender's 64-bit EUID

use core::convert::TryFrom;

use byte::{BytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use ssmarshal;

use crate::error::Error;
use crate::math::{Timestamps, Triad};


/// Largest frame any service sends
pub const MAX_FRAME_LEN: usize = 128;

/// Frame control of 16-bit addressed data frames, PAN id compressed
pub const FCTRL_DATA: u16 = 0x8841;

/// Frame control of data frames that request an acknowledgement
pub const FCTRL_DATA_ACK_REQ: u16 = 0x8861;

/// Frame control of blink frames
pub const FCTRL_BLINK: u8 = 0xC5;

/// Frame control of acknowledgement frames
pub const FCTRL_ACK: u16 = 0x0002;

/// Length of an acknowledgement frame, without FCS
pub const ACK_LEN: usize = 3;

/// The broadcast short address
pub const BROADCAST: u16 = 0xffff;

const HEADER_CODE_OFFSET: usize = 9;
const BLINK_CODE_OFFSET: usize = 10;


/// Identifies the purpose of a frame and the step of the exchange it belongs
/// to
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum FrameCode {
    /// Clock calibration packet
    Ccp = 0x0001,

    /// Tag asks for an address
    PanRequest = 0x0101,
    /// Master hands out an address
    PanResponse = 0x0102,

    /// Single-sided request
    SsRequest = 0x0011,
    /// Single-sided reply
    SsT1 = 0x0012,
    /// Single-sided final
    SsFinal = 0x0013,

    /// Single-sided request answered with an acknowledgement
    SsAckRequest = 0x0015,
    /// Single-sided reply after the acknowledgement
    SsAckT1 = 0x0016,
    /// Single-sided final after the acknowledgement
    SsAckFinal = 0x0017,

    /// Extended single-sided request
    SsExtRequest = 0x0021,
    /// Extended single-sided reply
    SsExtT1 = 0x0022,
    /// Extended single-sided final
    SsExtFinal = 0x0023,

    /// Double-sided request
    DsRequest = 0x0031,
    /// Double-sided first reply
    DsT1 = 0x0032,
    /// Double-sided second request
    DsT2 = 0x0033,
    /// Double-sided final
    DsFinal = 0x0034,

    /// Extended double-sided request
    DsExtRequest = 0x0041,
    /// Extended double-sided first reply
    DsExtT1 = 0x0042,
    /// Extended double-sided second request
    DsExtT2 = 0x0043,
    /// Extended double-sided final
    DsExtFinal = 0x0044,

    /// Single-sided multi-node request
    SsNrngRequest = 0x0211,
    /// Single-sided multi-node reply
    SsNrngT1 = 0x0212,

    /// Double-sided multi-node request
    DsNrngRequest = 0x0221,
    /// Double-sided multi-node first reply
    DsNrngT1 = 0x0222,
    /// Double-sided multi-node second request
    DsNrngT2 = 0x0223,
    /// Double-sided multi-node final
    DsNrngFinal = 0x0224,

    /// Reverse TDOA request
    RtdoaRequest = 0x0311,
    /// Reverse TDOA response
    RtdoaResponse = 0x0312,

    /// Site survey row broadcast
    SurveyBroadcast = 0x0412,
}


/// Reads the 16-bit frame control field
pub fn peek_fctrl(buf: &[u8]) -> Option<u16> {
    buf.read_with::<u16>(&mut 0, LE).ok()
}

/// Reads the code of a data or blink frame
pub fn peek_code(buf: &[u8]) -> Option<u16> {
    let offset = match (buf.first(), peek_fctrl(buf)) {
        (Some(&FCTRL_BLINK), _) => BLINK_CODE_OFFSET,
        (_, Some(FCTRL_DATA)) | (_, Some(FCTRL_DATA_ACK_REQ)) => HEADER_CODE_OFFSET,
        _ => return None,
    };
    buf.read_with::<u16>(&mut { offset }, LE).ok()
}

/// Reads the code of a frame as a known [`FrameCode`]
pub fn peek_frame_code(buf: &[u8]) -> Option<FrameCode> {
    peek_code(buf).and_then(|code| FrameCode::try_from(code).ok())
}

/// Writes an acknowledgement frame for `seq_num`
pub fn encode_ack(buf: &mut [u8], seq_num: u8) -> Result<usize, Error> {
    let mut offset = 0;
    buf.write_with(&mut offset, FCTRL_ACK, LE)?;
    let seq = buf.get_mut(offset).ok_or(Error::BufferTooSmall { required_len: ACK_LEN })?;
    *seq = seq_num;
    Ok(ACK_LEN)
}

/// Reads the sequence number of an acknowledgement frame
pub fn decode_ack(buf: &[u8]) -> Option<u8> {
    if buf.len() != ACK_LEN || peek_fctrl(buf) != Some(FCTRL_ACK) {
        return None;
    }
    buf.get(2).copied()
}


/// A frame of fixed length
pub trait Message: Sized + for<'de> Deserialize<'de> + Serialize {
    /// The length of the frame on the wire, without FCS
    const LEN: usize;

    /// Serializes the frame into `buf`, returns the number of bytes written
    fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.len() < Self::LEN {
            return Err(Error::BufferTooSmall {
                required_len: Self::LEN,
            });
        }
        let len = ssmarshal::serialize(&mut buf[..Self::LEN], self)?;
        debug_assert_eq!(len, Self::LEN);
        Ok(len)
    }

    /// Decodes a received frame of this type
    ///
    /// Returns `Ok(None)`, if the length doesn't match.
    fn decode(buf: &[u8]) -> Result<Option<Self>, Error> {
        if buf.len() != Self::LEN {
            return Ok(None);
        }
        let (frame, _) = ssmarshal::deserialize::<Self>(buf)?;
        Ok(Some(frame))
    }
}


/// Header of 16-bit addressed data frames
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FrameHeader {
    /// Frame control
    pub fctrl: u16,
    /// Sequence number
    pub seq_num: u8,
    /// PAN id
    pub pan_id: u16,
    /// Destination short address
    pub dst_address: u16,
    /// Source short address
    pub src_address: u16,
    /// Frame code
    pub code: u16,
}

impl FrameHeader {
    /// Length of the header on the wire
    pub const LEN: usize = 11;

    /// Creates a data frame header
    pub fn new(code: FrameCode, seq_num: u8, pan_id: u16, src: u16, dst: u16) -> Self {
        FrameHeader {
            fctrl: FCTRL_DATA,
            seq_num,
            pan_id,
            dst_address: dst,
            src_address: src,
            code: code.into(),
        }
    }

    /// Decodes the header of any data frame
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        ssmarshal::deserialize::<Self>(&buf[..Self::LEN]).ok().map(|(h, _)| h)
    }

    /// The code as a known [`FrameCode`]
    pub fn frame_code(&self) -> Option<FrameCode> {
        FrameCode::try_from(self.code).ok()
    }
}


/// Extra data carried by the extended two-way ranging frames
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ExtPayload {
    /// Transmission time in the clock master's 64-bit time base
    pub utime: u64,
    /// Position of the sender
    pub cartesian: Triad,
    /// Variance of the sender's position, per axis
    pub spherical_variance: Triad,
}


/// How much of a [`TwrFrame`] goes on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TwrKind {
    /// Header only
    Request,
    /// Header, reception and transmission timestamps
    Response,
    /// All four timestamps
    Final,
    /// All four timestamps and the [`ExtPayload`]
    FinalExt,
}

impl TwrKind {
    /// The length on the wire, without FCS
    pub const fn len(&self) -> usize {
        match self {
            TwrKind::Request => FrameHeader::LEN,
            TwrKind::Response => FrameHeader::LEN + 8,
            TwrKind::Final => FrameHeader::LEN + 16,
            TwrKind::FinalExt => FrameHeader::LEN + 16 + 32,
        }
    }
}

/// A two-way ranging frame
///
/// All steps of the two-party exchanges share this layout. Each step sends a
/// prefix of it, as given by its [`TwrKind`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct TwrFrame {
    /// Data frame header
    pub header: FrameHeader,
    /// Reception of the opening frame by the replier
    pub reception_timestamp: u32,
    /// Transmission of the reply
    pub transmission_timestamp: u32,
    /// Transmission of the opening frame
    pub request_timestamp: u32,
    /// Reception of the reply by the opener
    pub response_timestamp: u32,
    /// Extension
    pub ext: ExtPayload,
}

impl TwrFrame {
    /// Creates a frame with all timestamps zeroed
    pub fn new(header: FrameHeader) -> Self {
        TwrFrame {
            header,
            ..TwrFrame::default()
        }
    }

    /// The timestamps carried by the frame
    pub fn timestamps(&self) -> Timestamps {
        Timestamps {
            request: self.request_timestamp,
            response: self.response_timestamp,
            reception: self.reception_timestamp,
            transmission: self.transmission_timestamp,
        }
    }

    /// Stores `leg` in the timestamp fields
    pub fn set_timestamps(&mut self, leg: &Timestamps) {
        self.request_timestamp = leg.request;
        self.response_timestamp = leg.response;
        self.reception_timestamp = leg.reception;
        self.transmission_timestamp = leg.transmission;
    }

    /// Serializes the `kind` prefix of the frame into `buf`
    pub fn encode(&self, kind: TwrKind, buf: &mut [u8]) -> Result<usize, Error> {
        let mut full = [0; TwrKind::FinalExt.len()];
        ssmarshal::serialize(&mut full, self)?;

        let len = kind.len();
        if buf.len() < len {
            return Err(Error::BufferTooSmall { required_len: len });
        }
        buf[..len].copy_from_slice(&full[..len]);
        Ok(len)
    }

    /// Decodes a frame of `kind`
    ///
    /// Returns `Ok(None)`, if the length doesn't match. Fields not carried by
    /// `kind` are zero.
    pub fn decode(kind: TwrKind, buf: &[u8]) -> Result<Option<Self>, Error> {
        if buf.len() != kind.len() {
            return Ok(None);
        }
        let mut full = [0; TwrKind::FinalExt.len()];
        full[..buf.len()].copy_from_slice(buf);
        let (frame, _) = ssmarshal::deserialize::<Self>(&full)?;
        Ok(Some(frame))
    }
}


/// Request of the multi-node exchanges, also used for the double-sided second
/// request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NrngRequest {
    /// Data frame header, addressed to broadcast
    pub header: FrameHeader,
    /// Slot ids asked to respond
    pub slot_mask: u16,
}

impl Message for NrngRequest {
    const LEN: usize = FrameHeader::LEN + 2;
}

/// Reply of one node in a multi-node exchange
///
/// Replies send the first 21 bytes, finals all of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NrngFrame {
    /// Data frame header
    pub header: FrameHeader,
    /// Slot id of the replier
    pub slot_id: u16,
    /// Reception of the request by the replier
    pub reception_timestamp: u32,
    /// Transmission of the reply
    pub transmission_timestamp: u32,
    /// Transmission of the replier's first reply
    pub request_timestamp: u32,
    /// Reception of the second request by the replier
    pub response_timestamp: u32,
}

impl NrngFrame {
    /// Length of a reply
    pub const REPLY_LEN: usize = FrameHeader::LEN + 2 + 8;

    /// Length of a final
    pub const FINAL_LEN: usize = FrameHeader::LEN + 2 + 16;

    /// Serializes the first `len` bytes of the frame
    pub fn encode(&self, len: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let mut full = [0; Self::FINAL_LEN];
        ssmarshal::serialize(&mut full, self)?;
        if buf.len() < len || len > Self::FINAL_LEN {
            return Err(Error::BufferTooSmall { required_len: len });
        }
        buf[..len].copy_from_slice(&full[..len]);
        Ok(len)
    }

    /// Decodes a reply or a final, depending on `len`
    pub fn decode(len: usize, buf: &[u8]) -> Result<Option<Self>, Error> {
        if buf.len() != len || len > Self::FINAL_LEN {
            return Ok(None);
        }
        let mut full = [0; Self::FINAL_LEN];
        full[..len].copy_from_slice(buf);
        let (frame, _) = ssmarshal::deserialize::<Self>(&full)?;
        Ok(Some(frame))
    }
}


/// Reverse TDOA request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RtdoaRequest {
    /// Data frame header, addressed to broadcast
    pub header: FrameHeader,
    /// Slot ids asked to respond
    pub slot_mask: u16,
    /// Number of times the request was relayed
    pub rpt_count: u8,
    /// Maximum number of relays
    pub rpt_max: u8,
    /// Transmission time in the clock master's 64-bit time base
    pub tx_timestamp: u64,
}

impl Message for RtdoaRequest {
    const LEN: usize = FrameHeader::LEN + 2 + 2 + 8;
}

/// Reverse TDOA response
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RtdoaResponse {
    /// Data frame header, addressed to broadcast
    pub header: FrameHeader,
    /// Slot id of the responder
    pub slot_id: u16,
    /// Reception of the request, in the clock master's time base
    pub rx_timestamp: u64,
    /// Transmission of this response, in the clock master's time base
    pub tx_timestamp: u64,
}

impl Message for RtdoaResponse {
    const LEN: usize = FrameHeader::LEN + 2 + 16;
}


/// Clock calibration packet, a blink frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CcpFrame {
    /// Frame control, [`FCTRL_BLINK`]
    pub fctrl: u8,
    /// Sequence number
    pub seq_num: u8,
    /// EUID of the clock master
    pub euid: u64,
    /// Frame code
    pub code: u16,
    /// Number of times the packet was relayed
    pub rpt_count: u8,
    /// Maximum number of relays
    pub rpt_max: u8,
    /// Transmission time in the clock master's 64-bit time base
    pub transmission_timestamp: u64,
    /// Superframe period in UWB microseconds
    pub period: u32,
}

impl Message for CcpFrame {
    const LEN: usize = 26;
}


/// PAN association request or response, a blink frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PanFrame {
    /// Frame control, [`FCTRL_BLINK`]
    pub fctrl: u8,
    /// Sequence number
    pub seq_num: u8,
    /// EUID of the tag
    pub long_address: u64,
    /// Frame code
    pub code: u16,
    /// Number of times the frame was relayed
    pub rpt_count: u8,
    /// Maximum number of relays
    pub rpt_max: u8,
    /// Role bits the tag asks for
    pub role: u16,
    /// Assigned short address
    pub short_address: u16,
    /// Assigned slot id
    pub slot_id: u16,
    /// Assigned PAN id
    pub pan_id: u16,
    /// Lease in seconds
    pub lease_time: u16,
}

impl Message for PanFrame {
    const LEN: usize = 24;
}


/// Number of nodes a survey row holds
pub const SURVEY_ROW_LEN: usize = 16;

/// One row of the survey distance matrix
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SurveyBroadcast {
    /// Data frame header, addressed to broadcast
    pub header: FrameHeader,
    /// Survey sequence number
    pub seq: u16,
    /// Slot id of the node the row belongs to
    pub slot_id: u16,
    /// Slot ids with a valid range
    pub mask: u16,
    /// Ranges in meters, indexed by slot id
    pub ranges: [f32; SURVEY_ROW_LEN],
}

impl Message for SurveyBroadcast {
    const LEN: usize = FrameHeader::LEN + 6 + 4 * SURVEY_ROW_LEN;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian() {
        let header = FrameHeader::new(FrameCode::DsT1, 7, 0xDECA, 0x0001, 0x0002);
        let mut buf = [0; MAX_FRAME_LEN];
        let len = TwrFrame::new(header).encode(TwrKind::Request, &mut buf).unwrap();

        assert_eq!(len, 11);
        assert_eq!(&buf[..11], &[0x41, 0x88, 7, 0xCA, 0xDE, 0x02, 0x00, 0x01, 0x00, 0x32, 0x00]);
        assert_eq!(peek_frame_code(&buf[..len]), Some(FrameCode::DsT1));
    }

    #[test]
    fn twr_prefix_lengths() {
        assert_eq!(TwrKind::Response.len(), 19);
        assert_eq!(TwrKind::Final.len(), 27);
        assert_eq!(TwrKind::FinalExt.len(), 59);

        let mut frame = TwrFrame::new(FrameHeader::new(FrameCode::SsT1, 1, 0, 1, 2));
        frame.reception_timestamp = 0x1122_3344;
        frame.transmission_timestamp = 0x5566_7788;
        frame.request_timestamp = 99;

        let mut buf = [0; MAX_FRAME_LEN];
        let len = frame.encode(TwrKind::Response, &mut buf).unwrap();
        let decoded = TwrFrame::decode(TwrKind::Response, &buf[..len]).unwrap().unwrap();

        assert_eq!(decoded.reception_timestamp, 0x1122_3344);
        assert_eq!(decoded.transmission_timestamp, 0x5566_7788);
        // Not carried by a response
        assert_eq!(decoded.request_timestamp, 0);
    }

    #[test]
    fn wrong_length_is_not_ours() {
        let buf = [0u8; 20];
        assert_eq!(TwrFrame::decode(TwrKind::Response, &buf), Ok(None));
        assert_eq!(CcpFrame::decode(&buf), Ok(None));
    }

    #[test]
    fn blink_code_is_found() {
        let frame = CcpFrame {
            fctrl: FCTRL_BLINK,
            code: FrameCode::Ccp.into(),
            ..CcpFrame::default()
        };
        let mut buf = [0; MAX_FRAME_LEN];
        let len = frame.encode(&mut buf).unwrap();
        assert_eq!(len, CcpFrame::LEN);
        assert_eq!(peek_frame_code(&buf[..len]), Some(FrameCode::Ccp));
    }

    #[test]
    fn message_lengths() {
        assert_eq!(NrngRequest::LEN, 13);
        assert_eq!(NrngFrame::REPLY_LEN, 21);
        assert_eq!(NrngFrame::FINAL_LEN, 29);
        assert_eq!(RtdoaRequest::LEN, 23);
        assert_eq!(RtdoaResponse::LEN, 29);
        assert_eq!(PanFrame::LEN, 24);
        assert_eq!(SurveyBroadcast::LEN, 81);
    }

    #[test]
    fn ack_frame() {
        let mut buf = [0; ACK_LEN];
        assert_eq!(encode_ack(&mut buf, 42), Ok(ACK_LEN));
        assert_eq!(decode_ack(&buf), Some(42));
        assert_eq!(peek_code(&buf), None);
    }
}
