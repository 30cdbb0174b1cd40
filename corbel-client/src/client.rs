//! High-level object client.
//!
//! An [`ObjectClient`] owns the outbound connection cache for one target
//! and spawns a reply router per established connection. The router is the
//! only consumer of a connection's inbound messages on the client side:
//! it decodes reply headers, reassembles fragmented replies, and delivers
//! them to the waiting room.

use crate::contact::ContactInfoList;
use crate::error::ClientResult;
use crate::mediator::{ClientMediator, Invocation, InvokeOutcome};
use bytes::Bytes;
use corbel_protocol::{FragmentHeader, MessageKind, ReplyHeader, WireReader};
use corbel_transport::{
    run_read_loop, Connection, Inbound, OutboundConnectionCache, PendingReply, TargetProfile,
    TransportConfig, TransportError,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ObjectClient {
    contacts: Arc<ContactInfoList>,
    cache: Arc<OutboundConnectionCache>,
    config: TransportConfig,
}

impl ObjectClient {
    pub fn new(profile: TargetProfile, config: TransportConfig) -> ClientResult<Self> {
        let contacts = Arc::new(ContactInfoList::new(profile)?);
        let cache = Arc::new(OutboundConnectionCache::new(config.clone(), spawn_router));
        Ok(Self {
            contacts,
            cache,
            config,
        })
    }

    /// Two-way invocation; blocks until a terminal outcome.
    pub async fn invoke(
        &self,
        operation: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> ClientResult<InvokeOutcome> {
        self.mediator()
            .invoke(Invocation::two_way(operation, payload))
            .await
    }

    /// Fire-and-forget invocation; returns once the bytes are written.
    pub async fn invoke_one_way(
        &self,
        operation: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> ClientResult<()> {
        self.mediator()
            .invoke(Invocation::one_way(operation, payload))
            .await
            .map(|_| ())
    }

    /// A mediator for one invocation, exposing cancellation.
    pub fn mediator(&self) -> ClientMediator {
        ClientMediator::new(
            self.contacts.clone(),
            self.cache.clone(),
            self.config.clone(),
        )
    }

    pub fn contacts(&self) -> &ContactInfoList {
        &self.contacts
    }

    pub async fn shutdown(&self) {
        self.cache.close_all().await;
    }
}

/// Hangs the read loop and reply router off a freshly dialed connection.
fn spawn_router(conn: Arc<Connection>) {
    let (tx, rx) = mpsc::channel(conn.config().queue_depth);
    tokio::spawn(run_read_loop(conn.clone(), tx));
    tokio::spawn(route_replies(rx));
}

async fn route_replies(mut rx: mpsc::Receiver<Inbound>) {
    while let Some(Inbound { conn, message }) = rx.recv().await {
        if let Err(err) = route_one(&conn, message) {
            tracing::warn!(conn = conn.id(), %err, "reply routing failed, aborting connection");
            conn.purge(err).await;
            return;
        }
    }
}

fn route_one(conn: &Arc<Connection>, message: corbel_protocol::Message) -> Result<(), TransportError> {
    let order = message.byte_order();
    match message.kind() {
        MessageKind::Reply => {
            let mut r = WireReader::new(message.body.clone(), order);
            let header = ReplyHeader::decode(&mut r)?;
            let payload = r.take_rest();
            if message.header.flags.has_more_fragments() {
                conn.reply_assembler
                    .begin(header.request_id, (header, order), payload)?;
            } else {
                conn.room().response_received(PendingReply {
                    header,
                    order,
                    payload,
                });
            }
        }
        MessageKind::Fragment => {
            let mut r = WireReader::new(message.body.clone(), order);
            let fragment = FragmentHeader::decode(&mut r)?;
            let last = !message.header.flags.has_more_fragments();
            if let Some(((header, order), payload)) =
                conn.reply_assembler.append(fragment.request_id, r.take_rest(), last)?
            {
                conn.room().response_received(PendingReply {
                    header,
                    order,
                    payload,
                });
            }
        }
        other => {
            // a client connection never legitimately receives these
            tracing::warn!(conn = conn.id(), kind = ?other, "unexpected message kind, ignoring");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corbel_protocol::{
        build_message, ByteOrder, ReplyStatus, RequestId,
    };
    use corbel_transport::ContactInfo;
    use tokio::net::TcpListener;

    async fn accepted_client_conn() -> (Arc<Connection>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let conn = Connection::connect(
            ContactInfo::plain(addr.ip().to_string(), addr.port()),
            TransportConfig::default(),
            Connection::private_clock(),
        )
        .await
        .unwrap();
        (conn, accept.await.unwrap())
    }

    fn reply_header(id: u32) -> ReplyHeader {
        ReplyHeader {
            request_id: RequestId(id),
            status: ReplyStatus::NoException,
            contexts: vec![],
        }
    }

    #[tokio::test]
    async fn test_route_single_part_reply() {
        let (conn, _peer) = accepted_client_conn().await;
        let receipt = conn.room().register_waiter(RequestId(5)).unwrap();

        let msg = build_message(
            MessageKind::Reply,
            ByteOrder::Big,
            false,
            |w| reply_header(5).encode(w),
            b"result",
        );
        route_one(&conn, msg).unwrap();

        let reply = conn
            .room()
            .wait_for_response(receipt, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload.as_ref(), b"result");
    }

    #[tokio::test]
    async fn test_route_fragmented_reply_in_order() {
        let (conn, _peer) = accepted_client_conn().await;
        let receipt = conn.room().register_waiter(RequestId(8)).unwrap();

        let opener = build_message(
            MessageKind::Reply,
            ByteOrder::Little,
            true,
            |w| reply_header(8).encode(w),
            b"first-",
        );
        let middle = build_message(
            MessageKind::Fragment,
            ByteOrder::Little,
            true,
            |w| FragmentHeader { request_id: RequestId(8) }.encode(w),
            b"middle-",
        );
        let last = build_message(
            MessageKind::Fragment,
            ByteOrder::Little,
            false,
            |w| FragmentHeader { request_id: RequestId(8) }.encode(w),
            b"last",
        );

        route_one(&conn, opener).unwrap();
        route_one(&conn, middle).unwrap();
        assert!(conn.reply_assembler.is_open(RequestId(8)));
        route_one(&conn, last).unwrap();
        assert!(!conn.reply_assembler.is_open(RequestId(8)));

        let reply = conn
            .room()
            .wait_for_response(receipt, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload.as_ref(), b"first-middle-last");
        assert_eq!(reply.order, ByteOrder::Little);
    }

    #[tokio::test]
    async fn test_orphan_fragment_is_an_error() {
        let (conn, _peer) = accepted_client_conn().await;
        let stray = build_message(
            MessageKind::Fragment,
            ByteOrder::Big,
            false,
            |w| FragmentHeader { request_id: RequestId(42) }.encode(w),
            b"stray",
        );
        assert!(route_one(&conn, stray).is_err());
    }
}
