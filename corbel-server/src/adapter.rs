//! Object adapters and servants.
//!
//! The adapter answers "who serves this object key"; the servant performs
//! the operation. Both answers are closed variant sets so every caller
//! handles every case, and the resolve path is shared between ordinary
//! requests and locate probes.

use bytes::Bytes;
use corbel_protocol::{RequestId, ServiceContext, SystemExceptionBody};
use corbel_transport::TargetProfile;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a servant may know about the call it is handling. Threaded
/// explicitly; there is no ambient per-task state.
#[derive(Clone)]
pub struct CallContext {
    /// Peer label of the originating connection.
    pub peer: String,
    pub request_id: RequestId,
    /// Request service contexts, unopened.
    pub contexts: Vec<ServiceContext>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    pub fn new(
        peer: String,
        request_id: RequestId,
        contexts: Vec<ServiceContext>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            peer,
            request_id,
            contexts,
            cancelled,
        }
    }

    /// Cooperative cancellation checkpoint. Long-running servants should
    /// poll this and bail out early when it turns true.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What a servant produced for one operation.
#[derive(Debug, Clone)]
pub enum ServantReply {
    Normal(Bytes),
    /// An exception declared by the operation's contract; delivered to the
    /// caller as data, never retried.
    UserException(Bytes),
    /// Send the caller elsewhere.
    Forward(TargetProfile),
}

/// An object implementation.
pub trait Servant: Send + Sync {
    fn invoke(&self, operation: &str, payload: Bytes, ctx: &CallContext) -> ServantReply;
}

/// Outcome of resolving an object key.
#[derive(Clone)]
pub enum Resolution {
    Servant(Arc<dyn Servant>),
    NotFound,
    Forward(TargetProfile),
}

/// Maps object keys to servants.
pub trait ObjectAdapter: Send + Sync {
    fn resolve(&self, object_key: &[u8]) -> Resolution;
}

/// What an interceptor decided at one of its hook points.
pub enum Intercept {
    /// Proceed with the pipeline's own outcome.
    Continue,
    /// Replace the outcome, e.g. with a forward.
    Replace(ServantReply),
    /// Fail the request with a system exception.
    Fail(SystemExceptionBody),
}

/// Hook points around servant invocation. An interceptor's return value is
/// treated as one more classified outcome.
pub trait Interceptor: Send + Sync {
    fn receive_request(&self, _operation: &str, _ctx: &CallContext) -> Intercept {
        Intercept::Continue
    }

    fn send_reply(&self, _operation: &str, _reply: &ServantReply, _ctx: &CallContext) -> Intercept {
        Intercept::Continue
    }
}

/// The in-memory adapter: a key→servant map plus explicit forwards.
#[derive(Default)]
pub struct MapAdapter {
    servants: RwLock<HashMap<Vec<u8>, Arc<dyn Servant>>>,
    forwards: RwLock<HashMap<Vec<u8>, TargetProfile>>,
}

impl MapAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, object_key: impl Into<Vec<u8>>, servant: Arc<dyn Servant>) {
        self.servants.write().insert(object_key.into(), servant);
    }

    /// Registers a forwarding entry: requests for this key are redirected.
    pub fn register_forward(&self, object_key: impl Into<Vec<u8>>, profile: TargetProfile) {
        self.forwards.write().insert(object_key.into(), profile);
    }

    pub fn deregister(&self, object_key: &[u8]) {
        self.servants.write().remove(object_key);
        self.forwards.write().remove(object_key);
    }
}

impl ObjectAdapter for MapAdapter {
    fn resolve(&self, object_key: &[u8]) -> Resolution {
        if let Some(servant) = self.servants.read().get(object_key) {
            return Resolution::Servant(servant.clone());
        }
        if let Some(profile) = self.forwards.read().get(object_key) {
            return Resolution::Forward(profile.clone());
        }
        Resolution::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corbel_transport::ContactInfo;

    struct Echo;

    impl Servant for Echo {
        fn invoke(&self, _operation: &str, payload: Bytes, _ctx: &CallContext) -> ServantReply {
            ServantReply::Normal(payload)
        }
    }

    #[test]
    fn test_map_adapter_resolution() {
        let adapter = MapAdapter::new();
        adapter.register(&b"echo"[..], Arc::new(Echo));
        adapter.register_forward(
            &b"moved"[..],
            TargetProfile::new(vec![ContactInfo::plain("elsewhere", 6901)], &b"moved"[..]),
        );

        assert!(matches!(adapter.resolve(b"echo"), Resolution::Servant(_)));
        assert!(matches!(adapter.resolve(b"moved"), Resolution::Forward(_)));
        assert!(matches!(adapter.resolve(b"ghost"), Resolution::NotFound));

        adapter.deregister(b"echo");
        assert!(matches!(adapter.resolve(b"echo"), Resolution::NotFound));
    }

    #[test]
    fn test_call_context_cancellation() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = CallContext::new("peer".to_string(), RequestId(1), vec![], flag.clone());
        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_cancelled());
    }
}
