//! The reliable-delivery (ARQ) engine behind a `Session`.
//!
//! [ArqEngine] is the contract the session relies on; [kcp::KcpEngine] is the implementation
//!  that ships with this crate. The engine is purely reactive: it never reads a clock or touches
//!  a socket. Frames it needs to emit are handed to an output sink that the caller passes into
//!  the emitting calls (`update` and `flush`).

pub mod kcp;
pub mod segment;

use std::fmt::{Display, Formatter};
use bytes::Buf;
use crate::config::NodelayParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// A frame is shorter than a single segment header
    FrameTooShort,
    /// A segment carries a conversation id different from the engine's
    ConversationMismatch { expected: u32, actual: u32 },
    /// A segment's declared payload length exceeds the remaining frame
    MalformedSegment,
    UnknownCommand(u8),
    /// The packet would need more fragments than a receive window can hold
    PacketTooLarge { len: usize, max_len: usize },
    InvalidMtu(usize),
    /// There is no complete packet in the receive queue
    NothingToReceive,
    /// The caller's buffer cannot hold the next packet
    BufferTooSmall { required: usize, available: usize },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::FrameTooShort => write!(f, "frame is shorter than a segment header"),
            EngineError::ConversationMismatch { expected, actual } => write!(f, "segment for conversation {} received by conversation {}", actual, expected),
            EngineError::MalformedSegment => write!(f, "segment length exceeds frame"),
            EngineError::UnknownCommand(cmd) => write!(f, "unknown segment command {}", cmd),
            EngineError::PacketTooLarge { len, max_len } => write!(f, "packet of {} bytes exceeds maximum of {} bytes", len, max_len),
            EngineError::InvalidMtu(mtu) => write!(f, "invalid MTU {}", mtu),
            EngineError::NothingToReceive => write!(f, "no packet available"),
            EngineError::BufferTooSmall { required, available } => write!(f, "receive buffer of {} bytes cannot hold packet of {} bytes", available, required),
        }
    }
}

impl std::error::Error for EngineError {}


/// Operations a `Session` needs from its reliable-delivery engine.
///
/// Timestamps are milliseconds on a wrapping 32 bit clock chosen by the application; they must
///  be non-decreasing across calls.
pub trait ArqEngine {
    /// The conversation id that both endpoints must agree on
    fn conv(&self) -> u32;

    /// Feeds one raw frame for acknowledgement processing and reassembly. Never emits frames.
    fn input(&mut self, frame: &[u8]) -> Result<(), EngineError>;

    /// Stages one packet for transmission. Never emits frames.
    fn send(&mut self, data: &[u8]) -> Result<(), EngineError>;

    /// Moves the next complete packet into `buf`, returning its length
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Size of the next complete packet, `None` if there is none
    fn peek_size(&self) -> Option<usize>;

    /// Advances the engine's clock to `current` and performs whatever time-driven work is due,
    ///  emitting frames through `output`
    fn update(&mut self, current: u32, output: &mut dyn FnMut(&[u8]));

    /// Emits all pending acknowledgements and all data the windows permit right now
    fn flush(&mut self, output: &mut dyn FnMut(&[u8]));

    /// The timestamp at which `update` should be called next
    fn check(&self, current: u32) -> u32;

    /// Number of segments staged or in flight that are not acknowledged yet
    fn wait_snd(&self) -> usize;

    fn set_mtu(&mut self, mtu: usize) -> Result<(), EngineError>;

    /// `None` leaves the corresponding window unchanged
    fn set_window_sizes(&mut self, send_window: Option<u16>, receive_window: Option<u16>);

    fn set_nodelay_params(&mut self, params: NodelayParams);

    /// true once some segment was transmitted `dead_link` times without being acknowledged
    fn is_dead_link(&self) -> bool;
}

/// Reads the conversation id of a raw frame without decoding it, e.g. to route frames from a
///  shared socket to their session
pub fn conv_of_frame(frame: &[u8]) -> Option<u32> {
    if frame.len() < segment::SEGMENT_HEADER_LEN {
        return None;
    }
    let mut buf = frame;
    Some(buf.get_u32_le())
}
