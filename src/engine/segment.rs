//! Segment header wire format. All numbers are little endian:
//!
//! ```ascii
//!  0: conversation id (u32)
//!  4: command (u8): PUSH=81, ACK=82, WASK=83 (window probe), WINS=84 (window size)
//!  5: fragment counter (u8) - number of fragments of the same packet *following* this one
//!  6: receive window available at the sender (u16)
//!  8: timestamp (u32) - sender's clock for PUSH, echoed timestamp of the acked segment for ACK
//! 12: sequence number (u32)
//! 16: una (u32) - all sequence numbers below this were received by the sender
//! 20: payload length (u32)
//! 24: payload
//! ```
//!
//! A frame is a concatenation of segments.

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::engine::EngineError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const SEGMENT_HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Push = 81,
    Ack = 82,
    WindowProbe = 83,
    WindowSize = 84,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl SegmentHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd.into());
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decodes a header, checking that the declared payload is present in `buf` (without
    ///  consuming it)
    pub fn deser(buf: &mut impl Buf) -> Result<SegmentHeader, EngineError> {
        if buf.remaining() < SEGMENT_HEADER_LEN {
            return Err(EngineError::FrameTooShort);
        }

        let conv = buf.get_u32_le();
        let raw_cmd = buf.get_u8();
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le();

        let payload_len: usize = len.safe_cast();
        if buf.remaining() < payload_len {
            return Err(EngineError::MalformedSegment);
        }
        let cmd = Command::try_from(raw_cmd)
            .map_err(|_| EngineError::UnknownCommand(raw_cmd))?;

        Ok(SegmentHeader { conv, cmd, frg, wnd, ts, sn, una, len })
    }

    pub fn payload_len(&self) -> usize {
        self.len.safe_cast()
    }

    pub fn serialized_len(&self) -> usize {
        SEGMENT_HEADER_LEN + self.payload_len()
    }

    pub(crate) fn with_payload_len(mut self, len: usize) -> SegmentHeader {
        self.len = len.prechecked_cast();
        self
    }
}
