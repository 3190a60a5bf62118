//! Wire formats spoken by the pier gateway.
//!
//! Everything in this crate is pure byte-shuffling: no sockets, no async, no
//! allocation beyond the buffers handed back. The gateway's transport code
//! lives in the `pier` app; browsers and the scrcpy device server are the
//! peers on the other end of these encodings.

pub mod annexb;
pub mod buf;
pub mod control;
pub mod fsls;
pub mod mux;
pub mod stream_params;

use thiserror::Error;

/// Decode-side failures shared by every codec in this crate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    #[error("invalid utf-8 payload")]
    InvalidUtf8,
}
