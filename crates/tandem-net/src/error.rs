use std::io;

use tandem_types::TandemError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),

    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("malformed hidden-unit payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Types(#[from] TandemError),
}

impl NetError {
    /// True for errors caused by the peer sending something we cannot parse,
    /// as opposed to the socket itself failing.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;
