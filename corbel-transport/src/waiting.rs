//! Response correlation.
//!
//! Maps pending request ids to blocked callers. Delivery and failure both
//! travel through a oneshot per waiter; the map itself is concurrent.

use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use corbel_protocol::{ByteOrder, ReplyHeader, RequestId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A correlated reply: parsed header plus reassembled opaque payload,
/// still in the sender's byte order.
#[derive(Debug)]
pub struct PendingReply {
    pub header: ReplyHeader,
    pub order: ByteOrder,
    pub payload: Bytes,
}

#[derive(Debug)]
enum Delivery {
    Reply(PendingReply),
    Failed(TransportError),
}

struct Waiter {
    tx: oneshot::Sender<Delivery>,
    cancel: Arc<AtomicBool>,
}

/// Handed to the registering caller; consumed by `wait_for_response`.
pub struct WaitReceipt {
    request_id: RequestId,
    rx: oneshot::Receiver<Delivery>,
    cancel: Arc<AtomicBool>,
}

impl WaitReceipt {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Cancellation marker for the exchange behind this receipt. Checked
    /// cooperatively at unmarshal checkpoints.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

/// Pending-request registry for the client role of a connection.
#[derive(Default)]
pub struct ResponseWaitingRoom {
    waiters: DashMap<u32, Waiter>,
}

impl ResponseWaitingRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `request_id`. At most one waiter may exist
    /// per outstanding id; a second registration is a protocol-state error.
    pub fn register_waiter(&self, request_id: RequestId) -> TransportResult<WaitReceipt> {
        let (tx, rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        match self.waiters.entry(request_id.0) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TransportError::DuplicateWaiter(request_id.0))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Waiter {
                    tx,
                    cancel: cancel.clone(),
                });
                Ok(WaitReceipt {
                    request_id,
                    rx,
                    cancel,
                })
            }
        }
    }

    /// Blocks until the reply arrives, a failure is signaled, or `timeout`
    /// expires. Expiry synthesizes a communications-timeout failure and
    /// unregisters the waiter.
    pub async fn wait_for_response(
        &self,
        receipt: WaitReceipt,
        timeout: Duration,
    ) -> TransportResult<PendingReply> {
        let request_id = receipt.request_id;
        match tokio::time::timeout(timeout, receipt.rx).await {
            Ok(Ok(Delivery::Reply(reply))) => Ok(reply),
            Ok(Ok(Delivery::Failed(err))) => Err(err),
            // sender dropped without delivery: the connection went away
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                tracing::debug!(request_id = %request_id, "response wait timed out");
                self.unregister_waiter(request_id);
                Err(TransportError::ResponseTimeout(timeout))
            }
        }
    }

    /// Delivers a reply to its waiter. An unmatched request id (a race with
    /// an already-failed or retried call) is silently ignored.
    pub fn response_received(&self, reply: PendingReply) {
        let id = reply.header.request_id;
        match self.waiters.remove(&id.0) {
            Some((_, waiter)) => {
                let _ = waiter.tx.send(Delivery::Reply(reply));
            }
            None => {
                tracing::debug!(request_id = %id, "no waiter for reply, dropping");
            }
        }
    }

    /// Purge-only: wakes every waiter with the same classified failure and
    /// marks each associated exchange cancelled exactly once.
    pub fn signal_exception_to_all_waiters(&self, err: &TransportError) {
        let ids: Vec<u32> = self.waiters.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                waiter.cancel.swap(true, Ordering::SeqCst);
                let _ = waiter.tx.send(Delivery::Failed(err.clone()));
            }
        }
    }

    /// Idempotent: safe to call repeatedly across nested retry unwinding.
    pub fn unregister_waiter(&self, request_id: RequestId) {
        self.waiters.remove(&request_id.0);
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corbel_protocol::ReplyStatus;

    fn reply(id: u32, payload: &'static [u8]) -> PendingReply {
        PendingReply {
            header: ReplyHeader {
                request_id: RequestId(id),
                status: ReplyStatus::NoException,
                contexts: vec![],
            },
            order: ByteOrder::Big,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_correlation_isolation() {
        let room = ResponseWaitingRoom::new();
        let r5 = room.register_waiter(RequestId(5)).unwrap();
        let r6 = room.register_waiter(RequestId(6)).unwrap();

        room.response_received(reply(5, b"five"));

        let got = room
            .wait_for_response(r5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.header.request_id, RequestId(5));
        assert_eq!(got.payload.as_ref(), b"five");

        // waiter 6 is still pending
        assert_eq!(room.waiter_count(), 1);
        room.response_received(reply(6, b"six"));
        let got = room
            .wait_for_response(r6, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.payload.as_ref(), b"six");
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_noop() {
        let room = ResponseWaitingRoom::new();
        // no waiter registered; must not panic or leak
        room.response_received(reply(99, b"stray"));
        assert_eq!(room.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_waiter_rejected() {
        let room = ResponseWaitingRoom::new();
        let _r = room.register_waiter(RequestId(1)).unwrap();
        assert!(matches!(
            room.register_waiter(RequestId(1)),
            Err(TransportError::DuplicateWaiter(1))
        ));
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_failure_and_unregisters() {
        let room = ResponseWaitingRoom::new();
        let r = room.register_waiter(RequestId(2)).unwrap();
        let err = room
            .wait_for_response(r, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ResponseTimeout(_)));
        assert_eq!(room.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_exception_to_all_waiters() {
        let room = Arc::new(ResponseWaitingRoom::new());
        let mut receipts = Vec::new();
        let mut cancels = Vec::new();
        for id in [1u32, 2, 3] {
            let r = room.register_waiter(RequestId(id)).unwrap();
            cancels.push(r.cancel_handle());
            receipts.push(r);
        }

        let fault = TransportError::comm_failure("aborted", corbel_protocol::Completion::Maybe);
        room.signal_exception_to_all_waiters(&fault);

        for r in receipts {
            let err = room
                .wait_for_response(r, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err, fault);
        }
        for cancel in cancels {
            assert!(cancel.load(Ordering::SeqCst));
        }
        assert_eq!(room.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let room = ResponseWaitingRoom::new();
        let _r = room.register_waiter(RequestId(7)).unwrap();
        room.unregister_waiter(RequestId(7));
        room.unregister_waiter(RequestId(7));
        room.unregister_waiter(RequestId(7));
        assert_eq!(room.waiter_count(), 0);
    }
}
