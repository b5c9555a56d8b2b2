//! IPC bridge between the primary and its worker processes.
//!
//! Each worker gets a private control channel over its stdin/stdout. The
//! channel carries lifecycle messages only; application traffic never
//! crosses it.
//!
//! - **protocol**: Message types (ControlRequest/ControlResponse)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
