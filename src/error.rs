//! Error types for probing a single host.
//!
//! Every variant here ends up inside a per-host `ScanResult::Failure`; none of them
//! aborts a scan.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::MAX_VARINT_LEN;

/// Failure while decoding an inbound frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("VarInt runs past the end of the buffer")]
    Overrun,

    #[error("VarInt is longer than {} bytes", MAX_VARINT_LEN)]
    TooLarge,

    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketType(u8),

    #[error("frame declares {declared} bytes but only {available} are available")]
    Truncated { declared: usize, available: usize },

    #[error("status payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("status payload is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Failure while building the outbound handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("host name is {len} bytes, at most {max} fit in a handshake")]
    HostTooLong { len: usize, max: usize },
}

/// Anything that can go wrong while probing one host.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connection failed: {0}")]
    Connect(io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("write failed: {0}")]
    Send(io::Error),

    #[error("read failed: {0}")]
    Read(io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("empty response")]
    EmptyResponse,

    #[error("probe task panicked")]
    Panicked,
}
