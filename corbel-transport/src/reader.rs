//! Connection read loops.
//!
//! One read task per connection feeds socket bytes through a
//! [`MessageFramer`] and hands complete messages to the owner's event
//! channel. Close announcements and peer-reported message errors are
//! handled here; everything else is the dispatcher's business.
//!
//! Two strategies exist. `Optimized` reads opportunistically with
//! `try_read` and only parks on readiness when the socket has nothing,
//! arming a progress timeout while a message is partially received.
//! `Dedicated` performs ordinary awaited reads.

use crate::config::ReadStrategy;
use crate::connection::Connection;
use crate::error::TransportError;
use bytes::{Bytes, BytesMut};
use corbel_protocol::{
    FramerOutcome, HeaderFlags, Message, MessageFramer, MessageKind,
};
use corbel_protocol::Completion;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

/// One complete inbound message, tagged with its source connection.
pub struct Inbound {
    pub conn: Arc<Connection>,
    pub message: Message,
}

enum ReadFault {
    /// A partially received message made no progress within the timeout.
    Stalled,
    Io(io::Error),
}

/// Runs the read loop for `conn` until the connection dies or the event
/// receiver goes away. Always leaves the connection purged.
pub async fn run_read_loop(conn: Arc<Connection>, events: mpsc::Sender<Inbound>) {
    let Some(mut reader) = conn.take_reader() else {
        return;
    };
    let mut framer = MessageFramer::new(conn.config().framer_config());
    let mut buf = BytesMut::with_capacity(conn.config().read_buffer_size);
    let strategy = conn.config().read_strategy;
    let progress_timeout = conn.config().progress_timeout;
    let spare = conn.config().read_buffer_size;

    loop {
        // drain every complete message already buffered
        loop {
            match framer.offer(&mut buf) {
                Ok(FramerOutcome::Message(message)) => {
                    conn.touch();
                    match message.kind() {
                        MessageKind::CloseConnection => {
                            tracing::debug!(conn = conn.id(), peer = %conn.label(), "peer closed connection");
                            conn.purge(TransportError::ConnectionClosed).await;
                            return;
                        }
                        MessageKind::MessageError => {
                            conn.purge(TransportError::comm_failure(
                                "peer reported a message error",
                                Completion::Maybe,
                            ))
                            .await;
                            return;
                        }
                        _ => {
                            let inbound = Inbound {
                                conn: conn.clone(),
                                message,
                            };
                            if events.send(inbound).await.is_err() {
                                conn.purge(TransportError::ConnectionClosed).await;
                                return;
                            }
                        }
                    }
                }
                Ok(FramerOutcome::MoreData { need }) => {
                    if let Err(e) = framer.grow_for(&mut buf, need) {
                        fail_framing(&conn, e.into()).await;
                        return;
                    }
                    break;
                }
                Err(e) => {
                    fail_framing(&conn, e.into()).await;
                    return;
                }
            }
        }

        buf.reserve(spare);
        for id in conn.take_cancelled_chains() {
            framer.forget_request(id);
        }
        let stall_after = framer.expects_more_data(&buf).then_some(progress_timeout);
        let read = match strategy {
            ReadStrategy::Optimized => read_opportunistic(&mut reader, &mut buf, stall_after).await,
            ReadStrategy::Dedicated => read_awaited(&mut reader, &mut buf, stall_after).await,
        };
        match read {
            Ok(0) => {
                // EOF mid-message is a fault, a clean EOF is a close
                let err = if framer.expects_more_data(&buf) {
                    TransportError::comm_failure(
                        "connection ended inside a partial message",
                        Completion::Maybe,
                    )
                } else {
                    TransportError::ConnectionClosed
                };
                conn.purge(err).await;
                return;
            }
            Ok(_) => {}
            Err(ReadFault::Stalled) => {
                // a chain cancelled while this task was parked is not a
                // stall; re-check before giving up on the connection
                for id in conn.take_cancelled_chains() {
                    framer.forget_request(id);
                }
                if !framer.expects_more_data(&buf) {
                    continue;
                }
                conn.purge(TransportError::comm_failure(
                    "no progress on a partially received message",
                    Completion::Maybe,
                ))
                .await;
                return;
            }
            Err(ReadFault::Io(e)) => {
                conn.purge(TransportError::from_io(&e, Completion::Maybe)).await;
                return;
            }
        }
    }
}

/// A framing violation is unrecoverable: announce it to the peer
/// (best effort) and abort.
async fn fail_framing(conn: &Connection, err: TransportError) {
    tracing::warn!(conn = conn.id(), peer = %conn.label(), %err, "framing violation");
    let notice = Message::new(MessageKind::MessageError, HeaderFlags::new(), Bytes::new());
    let _ = conn.send_message(&notice).await;
    conn.purge(err).await;
}

async fn read_awaited(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    stall_after: Option<Duration>,
) -> Result<usize, ReadFault> {
    match stall_after {
        Some(limit) => match tokio::time::timeout(limit, reader.read_buf(buf)).await {
            Ok(result) => result.map_err(ReadFault::Io),
            Err(_) => Err(ReadFault::Stalled),
        },
        None => reader.read_buf(buf).await.map_err(ReadFault::Io),
    }
}

async fn read_opportunistic(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    stall_after: Option<Duration>,
) -> Result<usize, ReadFault> {
    loop {
        match reader.try_read_buf(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => match stall_after {
                Some(limit) => match tokio::time::timeout(limit, reader.readable()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return Err(ReadFault::Io(e)),
                    Err(_) => return Err(ReadFault::Stalled),
                },
                None => {
                    if let Err(e) = reader.readable().await {
                        return Err(ReadFault::Io(e));
                    }
                }
            },
            Err(e) => return Err(ReadFault::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::connection::ConnState;
    use corbel_protocol::{build_message, ByteOrder};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn accepted_pair(config: TransportConfig) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, peer) = listener.accept().await.unwrap();
        let conn = Connection::from_accepted(stream, peer, config, Connection::private_clock());
        (conn, connect.await.unwrap())
    }

    fn reply_message(id: u32, payload: &[u8]) -> Message {
        build_message(
            MessageKind::Reply,
            ByteOrder::Big,
            false,
            |w| w.put_u32(id),
            payload,
        )
    }

    async fn run_strategy(strategy: ReadStrategy) {
        let config = TransportConfig::default().with_read_strategy(strategy);
        let (conn, mut peer) = accepted_pair(config).await;
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_read_loop(conn, tx));

        // two messages, the second split mid-body across writes
        let first = reply_message(1, b"alpha").encode();
        let second = reply_message(2, b"beta").encode();
        peer.write_all(&first).await.unwrap();
        peer.write_all(&second[..8]).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(&second[8..]).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.peek_request_id(), Some(1));
        assert_eq!(&got.message.body[4..], b"alpha");
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.peek_request_id(), Some(2));
        assert_eq!(&got.message.body[4..], b"beta");
    }

    #[tokio::test]
    async fn test_optimized_strategy_delivers_messages() {
        run_strategy(ReadStrategy::Optimized).await;
    }

    #[tokio::test]
    async fn test_dedicated_strategy_delivers_messages() {
        run_strategy(ReadStrategy::Dedicated).await;
    }

    #[tokio::test]
    async fn test_close_announcement_purges() {
        let (conn, mut peer) = accepted_pair(TransportConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_read_loop(conn.clone(), tx));

        let close = Message::new(MessageKind::CloseConnection, HeaderFlags::new(), Bytes::new());
        peer.write_all(&close.encode()).await.unwrap();

        handle.await.unwrap();
        assert!(conn.is_purged());
        assert_eq!(conn.state(), ConnState::CloseRecvd);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_framing_violation_announces_and_aborts() {
        let (conn, mut peer) = accepted_pair(TransportConfig::default()).await;
        let (tx, _rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_read_loop(conn.clone(), tx));

        peer.write_all(b"XXXXxxxxxxxx").await.unwrap();

        handle.await.unwrap();
        assert!(conn.is_purged());
        assert_eq!(conn.state(), ConnState::Abort);

        // peer received a message-error notice before the shutdown
        let mut notice = vec![0u8; 12];
        peer.read_exact(&mut notice).await.unwrap();
        assert_eq!(notice[7], MessageKind::MessageError.as_u8());
    }

    #[tokio::test]
    async fn test_stalled_partial_message_aborts() {
        let config = TransportConfig::default()
            .with_progress_timeout(Duration::from_millis(50));
        let (conn, mut peer) = accepted_pair(config).await;
        let (tx, _rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_read_loop(conn.clone(), tx));

        // half a header, then silence
        peer.write_all(b"GIOP\x01\x02").await.unwrap();
        peer.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("read loop must abort on stall")
            .unwrap();
        assert_eq!(conn.state(), ConnState::Abort);
    }

    #[tokio::test]
    async fn test_cancelled_fragment_chain_does_not_stall() {
        let config = TransportConfig::default()
            .with_progress_timeout(Duration::from_millis(50));
        let (conn, mut peer) = accepted_pair(config).await;
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_read_loop(conn.clone(), tx));

        // open a fragment chain for request id 6, then cancel it
        let opener = build_message(
            MessageKind::Request,
            ByteOrder::Big,
            true,
            |w| w.put_u32(6),
            b"part1",
        );
        peer.write_all(&opener.encode()).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.peek_request_id(), Some(6));
        conn.forget_fragments(corbel_protocol::RequestId(6));

        // idle well past the progress timeout; the connection must survive
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!conn.is_purged());

        peer.write_all(&reply_message(7, b"later").encode())
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.peek_request_id(), Some(7));
        assert!(!conn.is_purged());
    }

    #[tokio::test]
    async fn test_eof_without_partial_is_clean_close() {
        let (conn, peer) = accepted_pair(TransportConfig::default()).await;
        let (tx, _rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_read_loop(conn.clone(), tx));

        drop(peer);
        handle.await.unwrap();
        assert_eq!(conn.state(), ConnState::CloseRecvd);
    }

    #[tokio::test]
    async fn test_eof_mid_message_is_a_fault() {
        let (conn, mut peer) = accepted_pair(TransportConfig::default()).await;
        let (tx, _rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_read_loop(conn.clone(), tx));

        let encoded = reply_message(3, b"truncated").encode();
        peer.write_all(&encoded[..encoded.len() - 2]).await.unwrap();
        peer.flush().await.unwrap();
        drop(peer);

        handle.await.unwrap();
        assert_eq!(conn.state(), ConnState::Abort);
    }
}
