//! Fragment reassembly and in-order hand-off.
//!
//! Two per-connection structures live here. [`FragmentAssembler`] collects
//! body chunks for a request id until the final fragment arrives, holding on
//! to whatever per-message metadata the role needs (a parsed request or
//! reply header). [`InOrderQueues`] preserves strict arrival order when
//! several workers service the same connection: the first submitter for an
//! id becomes its bound worker, later items queue behind it.

use crate::error::{TransportError, TransportResult};
use bytes::{BufMut, Bytes, BytesMut};
use corbel_protocol::{ProtocolError, RequestId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

struct Partial<M> {
    meta: M,
    chunks: Vec<Bytes>,
    total_len: usize,
}

/// Reassembles fragmented message bodies, keyed by request id.
pub struct FragmentAssembler<M> {
    inner: Mutex<HashMap<u32, Partial<M>>>,
}

impl<M> FragmentAssembler<M> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a reassembly chain for `id`. A second `begin` for an id whose
    /// chain is still open is a framing violation.
    pub fn begin(&self, id: RequestId, meta: M, first: Bytes) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&id.0) {
            return Err(TransportError::Framing(format!(
                "fragment chain already open for request id {id}"
            )));
        }
        let total_len = first.len();
        inner.insert(
            id.0,
            Partial {
                meta,
                chunks: vec![first],
                total_len,
            },
        );
        Ok(())
    }

    /// Appends a chunk in arrival order. Returns the metadata and the
    /// concatenated body when `last` closes the chain; the completion
    /// transition fires exactly once because the entry is removed with it.
    pub fn append(
        &self,
        id: RequestId,
        chunk: Bytes,
        last: bool,
    ) -> TransportResult<Option<(M, Bytes)>> {
        let mut inner = self.inner.lock();
        let partial = inner
            .get_mut(&id.0)
            .ok_or_else(|| TransportError::from(ProtocolError::OrphanFragment(id.0)))?;
        partial.total_len += chunk.len();
        partial.chunks.push(chunk);

        if !last {
            return Ok(None);
        }

        let partial = inner.remove(&id.0).unwrap();
        let mut body = BytesMut::with_capacity(partial.total_len);
        for chunk in &partial.chunks {
            body.put_slice(chunk);
        }
        Ok(Some((partial.meta, body.freeze())))
    }

    /// Drops an open chain (cancellation, purge). Idempotent.
    pub fn cancel(&self, id: RequestId) -> Option<M> {
        self.inner.lock().remove(&id.0).map(|p| p.meta)
    }

    pub fn is_open(&self, id: RequestId) -> bool {
        self.inner.lock().contains_key(&id.0)
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drops every open chain. Used during connection purge.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.len();
        inner.clear();
        n
    }
}

impl<M> Default for FragmentAssembler<M> {
    fn default() -> Self {
        Self::new()
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    // a worker is currently processing an item for this id
    bound: bool,
}

/// FIFO hand-off keyed by request id.
///
/// `submit` returns the item back when the caller should process it itself
/// (it became the bound worker for that id); otherwise the item is queued
/// behind the worker already processing the id. Workers call `next` after
/// finishing an item to either continue with the queued successor or unbind.
pub struct InOrderQueues<T> {
    inner: Mutex<HashMap<u32, QueueState<T>>>,
}

impl<T> InOrderQueues<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn submit(&self, id: RequestId, item: T) -> Option<T> {
        let mut inner = self.inner.lock();
        let state = inner.entry(id.0).or_insert_with(|| QueueState {
            queue: VecDeque::new(),
            bound: false,
        });
        if state.bound {
            state.queue.push_back(item);
            None
        } else {
            state.bound = true;
            Some(item)
        }
    }

    pub fn next(&self, id: RequestId) -> Option<T> {
        let mut inner = self.inner.lock();
        match inner.get_mut(&id.0) {
            Some(state) => match state.queue.pop_front() {
                Some(item) => Some(item),
                None => {
                    inner.remove(&id.0);
                    None
                }
            },
            None => None,
        }
    }

    /// Discards everything queued for `id`, returning how many items were
    /// dropped.
    pub fn drop_id(&self, id: RequestId) -> usize {
        self.inner
            .lock()
            .remove(&id.0)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drops every queue. Used during connection purge.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl<T> Default for InOrderQueues<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembly_in_order() {
        let assembler: FragmentAssembler<&str> = FragmentAssembler::new();
        let id = RequestId(7);
        assembler
            .begin(id, "req-header", Bytes::from_static(b"f1"))
            .unwrap();
        assert!(assembler.is_open(id));

        assert!(assembler
            .append(id, Bytes::from_static(b"f2"), false)
            .unwrap()
            .is_none());
        let (meta, body) = assembler
            .append(id, Bytes::from_static(b"f3"), true)
            .unwrap()
            .unwrap();
        assert_eq!(meta, "req-header");
        assert_eq!(body.as_ref(), b"f1f2f3");

        // the chain is gone: completion fires exactly once
        assert!(!assembler.is_open(id));
        assert!(assembler
            .append(id, Bytes::from_static(b"late"), true)
            .is_err());
    }

    #[test]
    fn test_double_begin_is_framing_error() {
        let assembler: FragmentAssembler<()> = FragmentAssembler::new();
        let id = RequestId(1);
        assembler.begin(id, (), Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            assembler.begin(id, (), Bytes::from_static(b"b")),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn test_orphan_fragment_rejected() {
        let assembler: FragmentAssembler<()> = FragmentAssembler::new();
        let err = assembler
            .append(RequestId(9), Bytes::from_static(b"x"), false)
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::from(ProtocolError::OrphanFragment(9))
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let assembler: FragmentAssembler<u32> = FragmentAssembler::new();
        let id = RequestId(4);
        assembler.begin(id, 42, Bytes::from_static(b"a")).unwrap();
        assert_eq!(assembler.cancel(id), Some(42));
        assert_eq!(assembler.cancel(id), None);
    }

    #[test]
    fn test_in_order_hand_off() {
        let queues: InOrderQueues<u8> = InOrderQueues::new();
        let id = RequestId(3);

        // first submitter binds and processes immediately
        assert_eq!(queues.submit(id, 1), Some(1));
        // arrivals while bound are queued
        assert_eq!(queues.submit(id, 2), None);
        assert_eq!(queues.submit(id, 3), None);

        // worker drains in arrival order, then unbinds
        assert_eq!(queues.next(id), Some(2));
        assert_eq!(queues.next(id), Some(3));
        assert_eq!(queues.next(id), None);
        assert!(queues.is_empty());

        // after unbinding, a new submitter binds again
        assert_eq!(queues.submit(id, 4), Some(4));
    }

    #[test]
    fn test_independent_ids_do_not_serialize() {
        let queues: InOrderQueues<&str> = InOrderQueues::new();
        assert_eq!(queues.submit(RequestId(1), "a"), Some("a"));
        assert_eq!(queues.submit(RequestId(2), "b"), Some("b"));
    }

    #[test]
    fn test_drop_id() {
        let queues: InOrderQueues<u8> = InOrderQueues::new();
        let id = RequestId(5);
        queues.submit(id, 1);
        queues.submit(id, 2);
        queues.submit(id, 3);
        assert_eq!(queues.drop_id(id), 2);
        assert!(queues.is_empty());
    }
}
