//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or decoding protocol messages.
///
/// All of these are fatal for the connection they occur on: a peer that
/// produces a malformed header cannot be resynchronized mid-stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'GIOP', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unknown message type: {0}")]
    UnknownMessageKind(u8),

    #[error("invalid header flags: {0:#x}")]
    InvalidFlags(u8),

    #[error("message too large: {size} bytes (cap {cap})")]
    MessageTooLarge { size: usize, cap: usize },

    #[error("truncated message body: need {needed} more bytes")]
    TruncatedBody { needed: usize },

    #[error("invalid reply status: {0}")]
    InvalidReplyStatus(u32),

    #[error("invalid locate status: {0}")]
    InvalidLocateStatus(u32),

    #[error("invalid addressing disposition: {0}")]
    InvalidDisposition(u16),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("fragment for unknown request id {0}")]
    OrphanFragment(u32),
}
