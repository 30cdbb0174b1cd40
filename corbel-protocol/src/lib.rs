//! # corbel-protocol
//!
//! Wire protocol implementation for corbel (GIOP-style binary RPC framing).
//!
//! This crate provides:
//! - The fixed 12-byte message header and its flag bits
//! - An incremental [`MessageFramer`] that turns a byte stream into messages
//! - Typed headers for Request / Reply / Locate / Fragment / Cancel bodies
//! - An endian-aware primitive codec (the header flags select byte order)

pub mod error;
pub mod frame;
pub mod framer;
pub mod message;
pub mod wire;

pub use error::ProtocolError;
pub use frame::{HeaderFlags, Message, MessageHeader, MessageKind, MESSAGE_HEADER_SIZE};
pub use framer::{FramerConfig, FramerOutcome, MessageFramer};
pub use message::{
    build_message, exception_id, AddressingDisposition, CancelRequestHeader, Completion,
    FragmentHeader,
    LocateReplyHeader, LocateRequestHeader, LocateStatus, ReplyHeader, ReplyStatus, RequestHeader,
    RequestId, ServiceContext, SystemExceptionBody, TargetAddress, SERVICE_CONTEXT_CODE_SETS,
    SERVICE_CONTEXT_VERSION,
};
pub use wire::{ByteOrder, WireReader, WireWriter};

/// Magic bytes opening every message header.
pub const MAGIC: [u8; 4] = *b"GIOP";

/// Protocol version emitted by this implementation.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 2;

/// Default cap on a single message (header + body), 8 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Default port for a corbel broker.
pub const DEFAULT_PORT: u16 = 6901;
