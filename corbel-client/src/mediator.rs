//! The client request mediator.
//!
//! One mediator drives one invocation end to end: obtain a connection,
//! allocate a request id, register in the waiting room, send (fragmenting
//! large payloads under a single write-gate hold), wait, classify the
//! reply, and either finish or feed the failure into the contact iterator
//! and loop. All retry context lives in this value; there is no ambient
//! per-task state.

use crate::contact::ContactInfoList;
use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use corbel_protocol::{
    build_message, AddressingDisposition, ByteOrder, CancelRequestHeader, FragmentHeader,
    MessageKind, ReplyStatus, RequestHeader, RequestId, ServiceContext, SystemExceptionBody,
    TargetAddress, WireReader, SERVICE_CONTEXT_CODE_SETS, SERVICE_CONTEXT_VERSION, VERSION_MAJOR,
    VERSION_MINOR,
};
use corbel_transport::{
    Connection, OutboundConnectionCache, PendingReply, TargetProfile, TransportConfig,
    TransportError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Terminal outcome of a successful exchange.
#[derive(Debug)]
pub enum InvokeOutcome {
    Normal(Bytes),
    /// Delivered to the caller as data, never retried.
    UserException(Bytes),
}

/// One invocation to perform.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub operation: String,
    pub payload: Bytes,
    pub contexts: Vec<ServiceContext>,
    pub response_expected: bool,
}

impl Invocation {
    pub fn two_way(operation: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            operation: operation.into(),
            payload: payload.into(),
            contexts: Vec::new(),
            response_expected: true,
        }
    }

    pub fn one_way(operation: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            response_expected: false,
            ..Self::two_way(operation, payload)
        }
    }
}

/// Code-set context offered on the first request of a connection.
/// UTF-8 for both char and wchar transmission.
const CODE_SET_UTF8: [u8; 8] = [0x05, 0x01, 0x00, 0x01, 0x00, 0x01, 0x01, 0x09];

pub struct ClientMediator {
    contacts: Arc<ContactInfoList>,
    cache: Arc<OutboundConnectionCache>,
    config: TransportConfig,
    cancelled: Arc<AtomicBool>,
    in_flight: Mutex<Option<(Arc<Connection>, RequestId)>>,
}

impl ClientMediator {
    pub fn new(
        contacts: Arc<ContactInfoList>,
        cache: Arc<OutboundConnectionCache>,
        config: TransportConfig,
    ) -> Self {
        Self {
            contacts,
            cache,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            in_flight: Mutex::new(None),
        }
    }

    /// Cancellation marker, checked cooperatively at unmarshal checkpoints.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Marks the invocation cancelled and tells the server about the
    /// in-flight exchange, if any. Never preemptive: the invocation itself
    /// notices the flag at its next checkpoint.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let in_flight = self.in_flight.lock().clone();
        if let Some((conn, request_id)) = in_flight {
            tracing::debug!(%request_id, "sending cancel for in-flight request");
            let msg = build_message(
                MessageKind::CancelRequest,
                ByteOrder::Big,
                false,
                |w| CancelRequestHeader { request_id }.encode(w),
                &[],
            );
            let _ = conn.send_message(&msg).await;
        }
    }

    /// Runs the invocation loop to a terminal outcome.
    pub async fn invoke(&self, call: Invocation) -> ClientResult<InvokeOutcome> {
        let mut iter = self.contacts.iterator(self.config.backoff);
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(ClientError::Cancelled);
            }
            let contact = iter.current()?;
            let conn = match self.cache.get_or_connect(&contact).await {
                Ok(conn) => conn,
                Err(err) => {
                    iter.report_exception(err).await?;
                    continue;
                }
            };

            let request_id = conn.allocate_request_id();
            let order = ByteOrder::Big;
            let target = target_address(&iter.object_key(), iter.disposition(), &self.contacts, order);
            let mut contexts = call.contexts.clone();
            if conn.codesets().is_none() {
                contexts.push(ServiceContext {
                    id: SERVICE_CONTEXT_CODE_SETS,
                    data: Bytes::from_static(&CODE_SET_UTF8),
                });
                contexts.push(ServiceContext {
                    id: SERVICE_CONTEXT_VERSION,
                    data: Bytes::from_static(&[VERSION_MAJOR, VERSION_MINOR]),
                });
                conn.note_codesets(Bytes::from_static(&CODE_SET_UTF8));
            }
            let header = RequestHeader {
                request_id,
                response_expected: call.response_expected,
                target,
                operation: call.operation.clone(),
                contexts,
            };

            let receipt = if call.response_expected {
                Some(conn.room().register_waiter(request_id)?)
            } else {
                None
            };

            if let Err(err) = self.send_request(&conn, &header, &call.payload, order).await {
                if receipt.is_some() {
                    conn.room().unregister_waiter(request_id);
                }
                conn.purge(err.clone()).await;
                iter.report_exception(err).await?;
                continue;
            }

            let Some(receipt) = receipt else {
                // one-way: done once the bytes are out
                return Ok(InvokeOutcome::Normal(Bytes::new()));
            };

            *self.in_flight.lock() = Some((conn.clone(), request_id));
            let waited = conn
                .room()
                .wait_for_response(receipt, self.config.response_timeout)
                .await;
            *self.in_flight.lock() = None;

            let reply = match waited {
                Ok(reply) => reply,
                Err(err @ TransportError::ResponseTimeout(_)) => {
                    // the exchange may still run remotely; ask it to stop
                    self.cancel_remote(&conn, request_id).await;
                    return Err(err.into());
                }
                Err(err) => {
                    iter.report_exception(err).await?;
                    continue;
                }
            };

            // unmarshal checkpoint
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(ClientError::Cancelled);
            }

            match reply.header.status {
                ReplyStatus::NoException => return Ok(InvokeOutcome::Normal(reply.payload)),
                ReplyStatus::UserException => {
                    return Ok(InvokeOutcome::UserException(reply.payload))
                }
                ReplyStatus::SystemException => {
                    let body = SystemExceptionBody::decode(reply.payload, reply.order)?;
                    let err = TransportError::from_system_exception(&body);
                    tracing::debug!(%request_id, exception = %body.exception_id, "system exception reply");
                    match iter.report_exception(err).await {
                        Ok(()) => continue,
                        Err(ClientError::Transport(_)) => {
                            // not retryable: surface the remote exception itself
                            return Err(ClientError::RemoteException {
                                exception_id: body.exception_id,
                                minor: body.minor,
                                completion: body.completion,
                            });
                        }
                        Err(other) => return Err(other),
                    }
                }
                ReplyStatus::LocationForward => {
                    let profile = TargetProfile::decode(reply.payload, reply.order)
                        .map_err(TransportError::from)?;
                    tracing::debug!(%request_id, "location forward");
                    self.contacts.adopt(profile.clone());
                    iter.report_redirect(profile)?;
                    continue;
                }
                ReplyStatus::NeedsAddressingMode => {
                    let expected = decode_expected_disposition(&reply)?;
                    tracing::debug!(%request_id, ?expected, "addressing mode renegotiation");
                    iter.report_addressing_retry(expected);
                    continue;
                }
            }
        }
    }

    /// Encodes and sends the request, splitting payloads above the
    /// fragment threshold. The write gate is held across all parts.
    async fn send_request(
        &self,
        conn: &Connection,
        header: &RequestHeader,
        payload: &Bytes,
        order: ByteOrder,
    ) -> Result<(), TransportError> {
        let threshold = self.config.fragment_threshold;
        if payload.len() <= threshold {
            let msg = build_message(
                MessageKind::Request,
                order,
                false,
                |w| header.encode(w),
                payload,
            );
            return conn.send_message(&msg).await;
        }

        let request_id = header.request_id;
        let mut parts = vec![build_message(
            MessageKind::Request,
            order,
            true,
            |w| header.encode(w),
            &payload[..threshold],
        )];
        let mut offset = threshold;
        while offset < payload.len() {
            let end = (offset + threshold).min(payload.len());
            parts.push(build_message(
                MessageKind::Fragment,
                order,
                end < payload.len(),
                |w| FragmentHeader { request_id }.encode(w),
                &payload[offset..end],
            ));
            offset = end;
        }
        tracing::debug!(%request_id, parts = parts.len(), "sending fragmented request");
        conn.send_all(&parts).await
    }

    async fn cancel_remote(&self, conn: &Connection, request_id: RequestId) {
        let msg = build_message(
            MessageKind::CancelRequest,
            ByteOrder::Big,
            false,
            |w| CancelRequestHeader { request_id }.encode(w),
            &[],
        );
        let _ = conn.send_message(&msg).await;
    }
}

fn target_address(
    object_key: &Bytes,
    disposition: AddressingDisposition,
    contacts: &ContactInfoList,
    order: ByteOrder,
) -> TargetAddress {
    match disposition {
        AddressingDisposition::Key => TargetAddress::Key(object_key.clone()),
        AddressingDisposition::Profile => {
            TargetAddress::Profile(contacts.root().encode(order))
        }
        AddressingDisposition::Reference => {
            TargetAddress::Reference(contacts.root().encode(order))
        }
    }
}

fn decode_expected_disposition(reply: &PendingReply) -> ClientResult<AddressingDisposition> {
    let mut r = WireReader::new(reply.payload.clone(), reply.order);
    let raw = r.get_u16().map_err(TransportError::from)?;
    AddressingDisposition::from_u16(raw)
        .map_err(TransportError::from)
        .map_err(ClientError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builders() {
        let call = Invocation::two_way("ping", &b"payload"[..]);
        assert!(call.response_expected);
        let call = Invocation::one_way("notify", &b""[..]);
        assert!(!call.response_expected);
        assert_eq!(call.operation, "notify");
    }

    #[tokio::test]
    async fn test_first_request_carries_negotiation_contexts() {
        use corbel_protocol::{MessageHeader, ReplyHeader, MESSAGE_HEADER_SIZE};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ctx_tx, mut ctx_rx) = tokio::sync::mpsc::channel(4);

        // a bare-bones peer that records each request's context ids
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let mut head = vec![0u8; MESSAGE_HEADER_SIZE];
                stream.read_exact(&mut head).await.unwrap();
                let header = MessageHeader::peek(&head).unwrap();
                let mut body = vec![0u8; header.body_len as usize];
                stream.read_exact(&mut body).await.unwrap();
                let mut r = WireReader::new(Bytes::from(body), header.byte_order());
                let request = RequestHeader::decode(&mut r).unwrap();
                let ids: Vec<u32> = request.contexts.iter().map(|c| c.id).collect();
                ctx_tx.send(ids).await.unwrap();

                let reply = ReplyHeader {
                    request_id: request.request_id,
                    status: ReplyStatus::NoException,
                    contexts: vec![],
                };
                let msg = build_message(
                    MessageKind::Reply,
                    header.byte_order(),
                    false,
                    |w| reply.encode(w),
                    &[],
                );
                stream.write_all(&msg.encode()).await.unwrap();
            }
        });

        let profile = TargetProfile::new(
            vec![corbel_transport::ContactInfo::plain(
                addr.ip().to_string(),
                addr.port(),
            )],
            &b"obj"[..],
        );
        let client = crate::client::ObjectClient::new(profile, TransportConfig::default()).unwrap();
        client.invoke("ping", &b""[..]).await.unwrap();
        client.invoke("ping", &b""[..]).await.unwrap();

        let first = ctx_rx.recv().await.unwrap();
        assert!(first.contains(&SERVICE_CONTEXT_CODE_SETS));
        assert!(first.contains(&SERVICE_CONTEXT_VERSION));
        let second = ctx_rx.recv().await.unwrap();
        assert!(second.is_empty());
        client.shutdown().await;
    }

    #[test]
    fn test_expected_disposition_decodes() {
        let mut w = corbel_protocol::WireWriter::new(ByteOrder::Little);
        w.put_u16(AddressingDisposition::Profile.as_u16());
        let reply = PendingReply {
            header: corbel_protocol::ReplyHeader {
                request_id: RequestId(1),
                status: ReplyStatus::NeedsAddressingMode,
                contexts: vec![],
            },
            order: ByteOrder::Little,
            payload: w.freeze(),
        };
        assert_eq!(
            decode_expected_disposition(&reply).unwrap(),
            AddressingDisposition::Profile
        );
    }
}
