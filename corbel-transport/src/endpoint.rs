//! Endpoint identity and target profiles.

use corbel_protocol::{ByteOrder, ProtocolError, WireReader, WireWriter};
use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Transport flavor of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    /// Cleartext TCP.
    Plain = 0,
    /// TLS endpoint (socket factory supplied externally).
    Secure = 1,
}

impl TransportKind {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => TransportKind::Plain,
            1 => TransportKind::Secure,
            other => return Err(ProtocolError::InvalidDisposition(other as u16)),
        })
    }
}

/// One concrete (transport, host, port) candidate for reaching a target.
///
/// Equality and hashing cover exactly these three fields; the outbound
/// connection cache and failover bookkeeping depend on that.
#[derive(Debug, Clone, Eq)]
pub struct ContactInfo {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
}

impl ContactInfo {
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
        }
    }

    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Plain, host, port)
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for ContactInfo {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport && self.host == other.host && self.port == other.port
    }
}

impl Hash for ContactInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ContactInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.transport {
            TransportKind::Plain => "iiop",
            TransportKind::Secure => "iiops",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Addressing description for one target: its candidate endpoints plus the
/// object key, as decoded out of an IOR-style profile.
///
/// Profile construction itself is out of scope; this is the minimal carrier
/// the transport needs, and the wire shape used inside location-forward
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    pub contacts: Vec<ContactInfo>,
    pub object_key: Bytes,
    /// Rotate the starting endpoint per fresh invocation.
    pub per_request_balancing: bool,
}

impl TargetProfile {
    pub fn new(contacts: Vec<ContactInfo>, object_key: impl Into<Bytes>) -> Self {
        Self {
            contacts,
            object_key: object_key.into(),
            per_request_balancing: false,
        }
    }

    pub fn with_per_request_balancing(mut self) -> Self {
        self.per_request_balancing = true;
        self
    }

    pub fn encode(&self, order: ByteOrder) -> Bytes {
        let mut w = WireWriter::new(order);
        w.put_u32(self.contacts.len() as u32);
        for contact in &self.contacts {
            w.put_u8(contact.transport as u8);
            w.put_string(&contact.host);
            w.put_u16(contact.port);
        }
        w.put_blob(&self.object_key);
        w.put_bool(self.per_request_balancing);
        w.freeze()
    }

    pub fn decode(payload: Bytes, order: ByteOrder) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload, order);
        let count = r.get_u32()? as usize;
        let mut contacts = Vec::with_capacity(count.min(32));
        for _ in 0..count {
            let transport = TransportKind::from_u8(r.get_u8()?)?;
            let host = r.get_string()?;
            let port = r.get_u16()?;
            contacts.push(ContactInfo::new(transport, host, port));
        }
        let object_key = r.get_blob()?;
        let per_request_balancing = r.get_bool()?;
        Ok(Self {
            contacts,
            object_key,
            per_request_balancing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(c: &ContactInfo) -> u64 {
        let mut h = DefaultHasher::new();
        c.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_identity_is_three_fields() {
        let a = ContactInfo::plain("10.0.0.1", 6901);
        let b = ContactInfo::plain("10.0.0.1", 6901);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = ContactInfo::new(TransportKind::Secure, "10.0.0.1", 6901);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ContactInfo::plain("host", 6901).to_string(),
            "iiop://host:6901"
        );
        assert_eq!(
            ContactInfo::new(TransportKind::Secure, "host", 6902).to_string(),
            "iiops://host:6902"
        );
    }

    #[test]
    fn test_profile_roundtrip() {
        let profile = TargetProfile::new(
            vec![
                ContactInfo::plain("a.example", 6901),
                ContactInfo::new(TransportKind::Secure, "b.example", 6902),
            ],
            &b"bank/accounts/7"[..],
        )
        .with_per_request_balancing();

        for order in [ByteOrder::Big, ByteOrder::Little] {
            let encoded = profile.encode(order);
            let decoded = TargetProfile::decode(encoded, order).unwrap();
            assert_eq!(decoded, profile);
        }
    }
}
