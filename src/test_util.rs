//! Helpers for testing code that drives sessions, without real sockets
pub mod lossy_link;
