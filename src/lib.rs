//! Reliable, ordered packet delivery over unreliable datagrams, based on the KCP protocol.
//!
//! A [session::Session] bridges application packets and raw frames. The application moves frames
//!  over its own transport: it feeds inbound frames to `Session::input` and sends whatever the
//!  session hands to its output function.

pub mod buffers;
pub mod clock;
pub mod config;
pub mod engine;
pub mod packet;
pub mod safe_converter;
pub mod session;
pub mod session_set;
pub mod test_util;
