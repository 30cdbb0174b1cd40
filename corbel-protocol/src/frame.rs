//! Fixed-size message header.
//!
//! Header layout (12 bytes, followed by `body_len` body bytes):
//!
//! ```text
//! +--------+-------+-------+-------+------+----------+
//! | magic  | major | minor | flags | kind | body_len |
//! | 4 bytes| 1 byte| 1 byte| 1 byte|1 byte| 4 bytes  |
//! +--------+-------+-------+-------+------+----------+
//! ```
//!
//! Flag bit 0 selects the byte order of `body_len` and of every multi-byte
//! field inside the body; bit 1 signals that more fragments follow.

use crate::error::ProtocolError;
use crate::wire::ByteOrder;
use crate::{MAGIC, VERSION_MAJOR, VERSION_MINOR};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed message header in bytes (4+1+1+1+1+4 = 12).
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Message type discriminant carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Reply = 1,
    CancelRequest = 2,
    LocateRequest = 3,
    LocateReply = 4,
    CloseConnection = 5,
    MessageError = 6,
    Fragment = 7,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => MessageKind::Request,
            1 => MessageKind::Reply,
            2 => MessageKind::CancelRequest,
            3 => MessageKind::LocateRequest,
            4 => MessageKind::LocateReply,
            5 => MessageKind::CloseConnection,
            6 => MessageKind::MessageError,
            7 => MessageKind::Fragment,
            other => return Err(ProtocolError::UnknownMessageKind(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Messages whose body opens with a request id. Used by the framer to
    /// track open fragment chains without understanding the full body.
    pub fn carries_request_id(self) -> bool {
        matches!(
            self,
            MessageKind::Request
                | MessageKind::Reply
                | MessageKind::CancelRequest
                | MessageKind::LocateRequest
                | MessageKind::LocateReply
                | MessageKind::Fragment
        )
    }
}

/// Header flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// Body and length fields are little-endian.
    pub const LITTLE_ENDIAN: u8 = 1 << 0;
    /// More fragments of this message follow.
    pub const MORE_FRAGMENTS: u8 = 1 << 1;

    /// Valid flags mask for protocol version 1.x.
    const VALID_MASK: u8 = 0x03;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_little_endian(mut self) -> Self {
        self.0 |= Self::LITTLE_ENDIAN;
        self
    }

    pub fn with_more_fragments(mut self) -> Self {
        self.0 |= Self::MORE_FRAGMENTS;
        self
    }

    pub fn is_little_endian(&self) -> bool {
        self.0 & Self::LITTLE_ENDIAN != 0
    }

    pub fn has_more_fragments(&self) -> bool {
        self.0 & Self::MORE_FRAGMENTS != 0
    }

    pub fn byte_order(&self) -> ByteOrder {
        if self.is_little_endian() {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }

    pub fn for_order(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Big => Self::new(),
            ByteOrder::Little => Self::new().with_little_endian(),
        }
    }
}

/// Parsed message header. Immutable once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub major: u8,
    pub minor: u8,
    pub flags: HeaderFlags,
    pub kind: MessageKind,
    pub body_len: u32,
}

impl MessageHeader {
    pub fn new(kind: MessageKind, flags: HeaderFlags, body_len: u32) -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            flags,
            kind,
            body_len,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.flags.byte_order()
    }

    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(MESSAGE_HEADER_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.kind.as_u8());
        match self.byte_order() {
            ByteOrder::Big => buf.put_u32(self.body_len),
            ByteOrder::Little => buf.put_u32_le(self.body_len),
        }
    }

    /// Decodes a header from the first [`MESSAGE_HEADER_SIZE`] bytes of
    /// `buf` without consuming them.
    ///
    /// The caller guarantees `buf.len() >= MESSAGE_HEADER_SIZE`.
    pub fn peek(buf: &[u8]) -> Result<Self, ProtocolError> {
        debug_assert!(buf.len() >= MESSAGE_HEADER_SIZE);

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let major = buf[4];
        let minor = buf[5];
        if major != VERSION_MAJOR {
            return Err(ProtocolError::UnsupportedVersion { major, minor });
        }

        let flags = HeaderFlags::from_bits(buf[6])?;
        let kind = MessageKind::from_u8(buf[7])?;

        let len_bytes: [u8; 4] = buf[8..12].try_into().unwrap();
        let body_len = match flags.byte_order() {
            ByteOrder::Big => u32::from_be_bytes(len_bytes),
            ByteOrder::Little => u32::from_le_bytes(len_bytes),
        };

        Ok(Self {
            major,
            minor,
            flags,
            kind,
            body_len,
        })
    }
}

/// A complete protocol message: parsed header plus raw body.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Message {
    /// Assembles a message from a kind, flags and an already-encoded body.
    pub fn new(kind: MessageKind, flags: HeaderFlags, body: Bytes) -> Self {
        Self {
            header: MessageHeader::new(kind, flags, body.len() as u32),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order()
    }

    /// Encodes header and body into one contiguous buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.body.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.body);
        buf
    }

    /// Peeks the request id for message kinds whose body opens with one.
    pub fn peek_request_id(&self) -> Option<u32> {
        if !self.header.kind.carries_request_id() || self.body.len() < 4 {
            return None;
        }
        let raw: [u8; 4] = self.body[0..4].try_into().unwrap();
        Some(match self.byte_order() {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }
}
