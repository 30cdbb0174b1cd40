//! Typed message bodies.
//!
//! The core parses only the header portion of each body; application payload
//! bytes after the header stay opaque and are handed to the marshaling layer
//! untouched.

use crate::error::ProtocolError;
use crate::frame::{HeaderFlags, Message, MessageKind};
use crate::wire::{ByteOrder, WireReader, WireWriter};
use bytes::Bytes;
use std::fmt;

/// A 32-bit request id with an explicit "undefined" sentinel.
///
/// Unique among outstanding exchanges on one connection; allocators must
/// skip the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

impl RequestId {
    pub const UNDEFINED: RequestId = RequestId(u32::MAX);

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One (id, blob) entry of the service-context list.
///
/// Carried per message and passed through unopened, except for the small
/// fixed set of contexts the core owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    pub id: u32,
    pub data: Bytes,
}

/// Context id owned by the core: code-set negotiation.
pub const SERVICE_CONTEXT_CODE_SETS: u32 = 1;
/// Context id owned by the core: protocol version negotiation.
pub const SERVICE_CONTEXT_VERSION: u32 = 6;

pub fn encode_contexts(w: &mut WireWriter, contexts: &[ServiceContext]) {
    w.put_u32(contexts.len() as u32);
    for ctx in contexts {
        w.put_u32(ctx.id);
        w.put_blob(&ctx.data);
    }
}

pub fn decode_contexts(r: &mut WireReader) -> Result<Vec<ServiceContext>, ProtocolError> {
    let count = r.get_u32()? as usize;
    let mut contexts = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let id = r.get_u32()?;
        let data = r.get_blob()?;
        contexts.push(ServiceContext { id, data });
    }
    Ok(contexts)
}

/// Encoding convention used to identify the target object of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AddressingDisposition {
    /// Raw object key.
    Key = 0,
    /// Full tagged profile.
    Profile = 1,
    /// Complete object reference.
    Reference = 2,
}

impl AddressingDisposition {
    pub fn from_u16(v: u16) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => AddressingDisposition::Key,
            1 => AddressingDisposition::Profile,
            2 => AddressingDisposition::Reference,
            other => return Err(ProtocolError::InvalidDisposition(other)),
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Target address of a request, one variant per addressing disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddress {
    Key(Bytes),
    Profile(Bytes),
    Reference(Bytes),
}

impl TargetAddress {
    pub fn disposition(&self) -> AddressingDisposition {
        match self {
            TargetAddress::Key(_) => AddressingDisposition::Key,
            TargetAddress::Profile(_) => AddressingDisposition::Profile,
            TargetAddress::Reference(_) => AddressingDisposition::Reference,
        }
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.disposition().as_u16());
        match self {
            TargetAddress::Key(b) | TargetAddress::Profile(b) | TargetAddress::Reference(b) => {
                w.put_blob(b)
            }
        }
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let disposition = AddressingDisposition::from_u16(r.get_u16()?)?;
        let data = r.get_blob()?;
        Ok(match disposition {
            AddressingDisposition::Key => TargetAddress::Key(data),
            AddressingDisposition::Profile => TargetAddress::Profile(data),
            AddressingDisposition::Reference => TargetAddress::Reference(data),
        })
    }
}

/// Request body header. The opaque payload follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: RequestId,
    pub response_expected: bool,
    pub target: TargetAddress,
    pub operation: String,
    pub contexts: Vec<ServiceContext>,
}

impl RequestHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.request_id.0);
        w.put_bool(self.response_expected);
        self.target.encode(w);
        w.put_string(&self.operation);
        encode_contexts(w, &self.contexts);
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: RequestId(r.get_u32()?),
            response_expected: r.get_bool()?,
            target: TargetAddress::decode(r)?,
            operation: r.get_string()?,
            contexts: decode_contexts(r)?,
        })
    }
}

/// Classification of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyStatus {
    NoException = 0,
    UserException = 1,
    SystemException = 2,
    LocationForward = 3,
    NeedsAddressingMode = 5,
}

impl ReplyStatus {
    pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => ReplyStatus::NoException,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::SystemException,
            3 => ReplyStatus::LocationForward,
            5 => ReplyStatus::NeedsAddressingMode,
            other => return Err(ProtocolError::InvalidReplyStatus(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Reply body header. The opaque payload follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub request_id: RequestId,
    pub status: ReplyStatus,
    pub contexts: Vec<ServiceContext>,
}

impl ReplyHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.request_id.0);
        w.put_u32(self.status.as_u32());
        encode_contexts(w, &self.contexts);
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: RequestId(r.get_u32()?),
            status: ReplyStatus::from_u32(r.get_u32()?)?,
            contexts: decode_contexts(r)?,
        })
    }
}

/// Outcome of a locate probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LocateStatus {
    UnknownObject = 0,
    ObjectHere = 1,
    ObjectForward = 2,
}

impl LocateStatus {
    pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => LocateStatus::UnknownObject,
            1 => LocateStatus::ObjectHere,
            2 => LocateStatus::ObjectForward,
            other => return Err(ProtocolError::InvalidLocateStatus(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateRequestHeader {
    pub request_id: RequestId,
    pub target: TargetAddress,
}

impl LocateRequestHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.request_id.0);
        self.target.encode(w);
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: RequestId(r.get_u32()?),
            target: TargetAddress::decode(r)?,
        })
    }
}

/// Locate reply header. A forward payload follows when status is
/// [`LocateStatus::ObjectForward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateReplyHeader {
    pub request_id: RequestId,
    pub status: LocateStatus,
}

impl LocateReplyHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.request_id.0);
        w.put_u32(self.status.as_u32());
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: RequestId(r.get_u32()?),
            status: LocateStatus::from_u32(r.get_u32()?)?,
        })
    }
}

/// Fragment body header: the continuation chunk follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub request_id: RequestId,
}

impl FragmentHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.request_id.0);
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: RequestId(r.get_u32()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequestHeader {
    pub request_id: RequestId,
}

impl CancelRequestHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.request_id.0);
    }

    pub fn decode(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: RequestId(r.get_u32()?),
        })
    }
}

/// Well-known system exception repository ids.
pub mod exception_id {
    pub const COMM_FAILURE: &str = "IDL:omg.org/CORBA/COMM_FAILURE:1.0";
    pub const TRANSIENT: &str = "IDL:omg.org/CORBA/TRANSIENT:1.0";
    pub const REBIND: &str = "IDL:omg.org/CORBA/REBIND:1.0";
    pub const TIMEOUT: &str = "IDL:omg.org/CORBA/TIMEOUT:1.0";
    pub const OBJECT_NOT_EXIST: &str = "IDL:omg.org/CORBA/OBJECT_NOT_EXIST:1.0";
    pub const UNKNOWN: &str = "IDL:omg.org/CORBA/UNKNOWN:1.0";
    pub const INTERNAL: &str = "IDL:omg.org/CORBA/INTERNAL:1.0";
}

/// At what point the failed operation had progressed when a system
/// exception was raised. Drives the client's retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Completion {
    Yes = 0,
    No = 1,
    Maybe = 2,
}

impl Completion {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Completion::Yes,
            1 => Completion::No,
            _ => Completion::Maybe,
        }
    }
}

/// Payload of a [`ReplyStatus::SystemException`] reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemExceptionBody {
    pub exception_id: String,
    pub minor: u32,
    pub completion: Completion,
}

impl SystemExceptionBody {
    pub fn new(exception_id: &str, minor: u32, completion: Completion) -> Self {
        Self {
            exception_id: exception_id.to_string(),
            minor,
            completion,
        }
    }

    pub fn encode(&self, order: ByteOrder) -> Bytes {
        let mut w = WireWriter::new(order);
        w.put_string(&self.exception_id);
        w.put_u32(self.minor);
        w.put_u32(self.completion as u32);
        w.freeze()
    }

    pub fn decode(payload: Bytes, order: ByteOrder) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload, order);
        Ok(Self {
            exception_id: r.get_string()?,
            minor: r.get_u32()?,
            completion: Completion::from_u32(r.get_u32()?),
        })
    }
}

/// Builds a complete single-part message: encoded body header + payload.
pub fn build_message<F>(
    kind: MessageKind,
    order: ByteOrder,
    more_fragments: bool,
    encode_header: F,
    payload: &[u8],
) -> Message
where
    F: FnOnce(&mut WireWriter),
{
    let mut w = WireWriter::with_capacity(order, 64 + payload.len());
    encode_header(&mut w);
    w.put_slice(payload);
    let mut flags = HeaderFlags::for_order(order);
    if more_fragments {
        flags = flags.with_more_fragments();
    }
    Message::new(kind, flags, w.freeze())
}
