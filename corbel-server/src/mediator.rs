//! The server request mediator.
//!
//! One mediator handles every decoded message of one connection:
//! request reassembly and execution, locate probes, cancellation, and
//! reply encoding. The invocation pipeline is
//! parse → addressing-disposition check → resolve → invoke → reply;
//! a panic or internal fault inside the servant becomes a generic
//! system-exception reply and the connection stays up.

use crate::adapter::{
    CallContext, Intercept, Interceptor, ObjectAdapter, Resolution, ServantReply,
};
use bytes::Bytes;
use corbel_protocol::{
    build_message, exception_id, AddressingDisposition, ByteOrder, CancelRequestHeader,
    Completion, FragmentHeader, LocateReplyHeader, LocateRequestHeader, LocateStatus, Message,
    MessageKind, ReplyHeader, ReplyStatus, RequestHeader, RequestId, SystemExceptionBody,
    TargetAddress, WireReader, WireWriter, SERVICE_CONTEXT_CODE_SETS, SERVICE_CONTEXT_VERSION,
    VERSION_MAJOR,
};
use corbel_transport::{Connection, TargetProfile, TransportResult};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Classified outcome of the request pipeline, one variant per reply status.
enum Outcome {
    Data(Bytes),
    User(Bytes),
    Forward(TargetProfile),
    NeedsAddressing(AddressingDisposition),
    System(SystemExceptionBody),
}

fn reply_to_outcome(reply: ServantReply) -> Outcome {
    match reply {
        ServantReply::Normal(payload) => Outcome::Data(payload),
        ServantReply::UserException(payload) => Outcome::User(payload),
        ServantReply::Forward(profile) => Outcome::Forward(profile),
    }
}

pub struct ServerMediator {
    adapter: Arc<dyn ObjectAdapter>,
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl ServerMediator {
    pub fn new(adapter: Arc<dyn ObjectAdapter>) -> Self {
        Self {
            adapter,
            interceptors: Vec::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Box<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Entry point for one decoded message. Faults that poison the whole
    /// connection purge it; per-request faults only answer that request.
    pub async fn handle(&self, conn: Arc<Connection>, message: Message) {
        let order = message.byte_order();
        let result = match message.kind() {
            MessageKind::Request => self.handle_request(&conn, &message, order).await,
            MessageKind::Fragment => self.handle_fragment(&conn, &message, order).await,
            MessageKind::LocateRequest => self.handle_locate(&conn, &message, order).await,
            MessageKind::CancelRequest => self.handle_cancel(&conn, &message, order),
            other => {
                tracing::warn!(conn = conn.id(), kind = ?other, "unexpected message kind, ignoring");
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(conn = conn.id(), peer = %conn.label(), %err, "request handling failed");
            conn.purge(err).await;
        }
    }

    async fn handle_request(
        &self,
        conn: &Arc<Connection>,
        message: &Message,
        order: ByteOrder,
    ) -> TransportResult<()> {
        let mut r = WireReader::new(message.body.clone(), order);
        let header = RequestHeader::decode(&mut r)?;
        let payload = r.take_rest();

        if message.header.flags.has_more_fragments() {
            conn.request_assembler
                .begin(header.request_id, (header, order), payload)?;
            return Ok(());
        }
        self.execute(conn, header, order, payload).await
    }

    async fn handle_fragment(
        &self,
        conn: &Arc<Connection>,
        message: &Message,
        order: ByteOrder,
    ) -> TransportResult<()> {
        let mut r = WireReader::new(message.body.clone(), order);
        let fragment = FragmentHeader::decode(&mut r)?;
        let last = !message.header.flags.has_more_fragments();
        if let Some(((header, order), payload)) =
            conn.request_assembler
                .append(fragment.request_id, r.take_rest(), last)?
        {
            return self.execute(conn, header, order, payload).await;
        }
        Ok(())
    }

    fn handle_cancel(
        &self,
        conn: &Arc<Connection>,
        message: &Message,
        order: ByteOrder,
    ) -> TransportResult<()> {
        let mut r = WireReader::new(message.body.clone(), order);
        let header = CancelRequestHeader::decode(&mut r)?;
        let id = header.request_id;

        let cancelled = conn.cancel_server_request(id);
        let open_chain = conn.request_assembler.cancel(id).is_some();
        // the read task tracks open chains too; without this it would keep
        // expecting fragments and eventually abort a healthy connection
        conn.forget_fragments(id);
        let dropped = conn.in_order.drop_id(id);
        if cancelled || open_chain || dropped > 0 {
            tracing::debug!(conn = conn.id(), request_id = %id, "request cancelled");
        } else {
            tracing::debug!(conn = conn.id(), request_id = %id, "cancel for unknown request, ignoring");
        }
        Ok(())
    }

    async fn handle_locate(
        &self,
        conn: &Arc<Connection>,
        message: &Message,
        order: ByteOrder,
    ) -> TransportResult<()> {
        let mut r = WireReader::new(message.body.clone(), order);
        let header = LocateRequestHeader::decode(&mut r)?;

        let key = match &header.target {
            TargetAddress::Key(key) => key.clone(),
            // a locate probe is resolvable through the profile's own key
            TargetAddress::Profile(blob) | TargetAddress::Reference(blob) => {
                TargetProfile::decode(blob.clone(), order)?.object_key
            }
        };

        let (status, forward) = match self.adapter.resolve(&key) {
            Resolution::Servant(_) => (LocateStatus::ObjectHere, None),
            Resolution::NotFound => (LocateStatus::UnknownObject, None),
            Resolution::Forward(profile) => {
                (LocateStatus::ObjectForward, Some(profile.encode(order)))
            }
        };
        tracing::debug!(conn = conn.id(), request_id = %header.request_id, ?status, "locate probe");

        let reply_header = LocateReplyHeader {
            request_id: header.request_id,
            status,
        };
        let reply = build_message(
            MessageKind::LocateReply,
            order,
            false,
            |w| reply_header.encode(w),
            forward.as_deref().unwrap_or(&[]),
        );
        conn.send_message(&reply).await
    }

    /// Runs one fully reassembled request through the pipeline and sends
    /// the reply.
    pub async fn execute(
        &self,
        conn: &Arc<Connection>,
        header: RequestHeader,
        order: ByteOrder,
        payload: Bytes,
    ) -> TransportResult<()> {
        let request_id = header.request_id;
        let cancelled = conn.begin_server_request(request_id);

        // code sets are negotiated once, from the first request that
        // carries the context
        if let Some(cs) = header
            .contexts
            .iter()
            .find(|c| c.id == SERVICE_CONTEXT_CODE_SETS)
        {
            conn.note_codesets(cs.data.clone());
        }
        if let Some(vc) = header
            .contexts
            .iter()
            .find(|c| c.id == SERVICE_CONTEXT_VERSION)
        {
            if vc.data.len() >= 2 {
                if vc.data[0] != VERSION_MAJOR {
                    tracing::warn!(
                        conn = conn.id(),
                        peer_major = vc.data[0],
                        peer_minor = vc.data[1],
                        "peer speaks a different protocol major version"
                    );
                }
                conn.note_peer_version(vc.data[0], vc.data[1]);
            }
        }

        let ctx = CallContext::new(
            conn.label().to_string(),
            request_id,
            header.contexts.clone(),
            cancelled,
        );
        let outcome = self.run_pipeline(&header, payload, &ctx);
        conn.end_server_request(request_id);

        if !header.response_expected {
            return Ok(());
        }
        // a cancelled exchange ran to completion, but its caller is gone
        if ctx.is_cancelled() {
            tracing::debug!(conn = conn.id(), %request_id, "reply suppressed for cancelled request");
            return Ok(());
        }
        let parts = build_reply_messages(request_id, outcome, order, conn.config().fragment_threshold);
        conn.send_all(&parts).await
    }

    fn run_pipeline(&self, header: &RequestHeader, payload: Bytes, ctx: &CallContext) -> Outcome {
        // disposition check: this adapter addresses by object key; anything
        // else is renegotiated, not failed
        let key = match &header.target {
            TargetAddress::Key(key) => key.clone(),
            TargetAddress::Profile(_) | TargetAddress::Reference(_) => {
                return Outcome::NeedsAddressing(AddressingDisposition::Key);
            }
        };

        for interceptor in &self.interceptors {
            match interceptor.receive_request(&header.operation, ctx) {
                Intercept::Continue => {}
                Intercept::Replace(reply) => return reply_to_outcome(reply),
                Intercept::Fail(body) => return Outcome::System(body),
            }
        }

        let servant = match self.adapter.resolve(&key) {
            Resolution::Servant(servant) => servant,
            Resolution::NotFound => {
                return Outcome::System(SystemExceptionBody::new(
                    exception_id::OBJECT_NOT_EXIST,
                    1,
                    Completion::No,
                ));
            }
            Resolution::Forward(profile) => return Outcome::Forward(profile),
        };

        let operation = header.operation.clone();
        let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            servant.invoke(&operation, payload, ctx)
        }));
        let mut reply = match invoked {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(request_id = %header.request_id, operation = %operation, "servant panicked");
                return Outcome::System(SystemExceptionBody::new(
                    exception_id::UNKNOWN,
                    1,
                    Completion::Maybe,
                ));
            }
        };

        for interceptor in &self.interceptors {
            match interceptor.send_reply(&operation, &reply, ctx) {
                Intercept::Continue => {}
                Intercept::Replace(replaced) => reply = replaced,
                Intercept::Fail(body) => return Outcome::System(body),
            }
        }
        reply_to_outcome(reply)
    }
}

/// Encodes one reply, splitting payloads above the fragment threshold.
fn build_reply_messages(
    request_id: RequestId,
    outcome: Outcome,
    order: ByteOrder,
    threshold: usize,
) -> Vec<Message> {
    let (status, payload) = match outcome {
        Outcome::Data(payload) => (ReplyStatus::NoException, payload),
        Outcome::User(payload) => (ReplyStatus::UserException, payload),
        Outcome::Forward(profile) => (ReplyStatus::LocationForward, profile.encode(order)),
        Outcome::NeedsAddressing(disposition) => {
            let mut w = WireWriter::new(order);
            w.put_u16(disposition.as_u16());
            (ReplyStatus::NeedsAddressingMode, w.freeze())
        }
        Outcome::System(body) => (ReplyStatus::SystemException, body.encode(order)),
    };
    let header = ReplyHeader {
        request_id,
        status,
        contexts: vec![],
    };

    if payload.len() <= threshold {
        return vec![build_message(
            MessageKind::Reply,
            order,
            false,
            |w| header.encode(w),
            &payload,
        )];
    }

    let mut parts = vec![build_message(
        MessageKind::Reply,
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
    parts
}
