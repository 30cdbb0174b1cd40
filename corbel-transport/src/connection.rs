//! The connection abstraction.
//!
//! One `Connection` is one transport channel with an explicit lifecycle:
//!
//! ```text
//! Opening -> Established -> CloseSent | CloseRecvd -> Abort
//! ```
//!
//! A terminal state is reached exactly once, and purge runs exactly once
//! per terminal transition. The write path is single-writer at all times:
//! one async mutex is held across an entire (possibly multi-fragment)
//! outbound message.

use crate::config::TransportConfig;
use crate::endpoint::ContactInfo;
use crate::error::{TransportError, TransportResult};
use crate::fragments::{FragmentAssembler, InOrderQueues};
use crate::waiting::ResponseWaitingRoom;
use bytes::Bytes;
use corbel_protocol::{ByteOrder, Completion, Message, ReplyHeader, RequestHeader, RequestId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Opening,
    Established,
    CloseSent,
    CloseRecvd,
    Abort,
}

impl ConnState {
    /// States in which no further traffic may be initiated.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnState::CloseRecvd | ConnState::Abort)
    }
}

/// Which side of the exchange this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Client,
    Server,
}

/// A transport channel.
pub struct Connection {
    id: u64,
    label: String,
    role: ConnRole,
    contact: Option<ContactInfo>,
    config: TransportConfig,
    state_tx: watch::Sender<ConnState>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader: parking_lot::Mutex<Option<OwnedReadHalf>>,
    next_request_id: AtomicU32,
    room: ResponseWaitingRoom,
    /// Server role: request id of each in-flight exchange, mapped to its
    /// cooperative cancellation flag.
    server_requests: DashMap<u32, Arc<AtomicBool>>,
    /// Server role: reassembly of fragmented requests.
    pub request_assembler: FragmentAssembler<(RequestHeader, ByteOrder)>,
    /// Client role: reassembly of fragmented replies.
    pub reply_assembler: FragmentAssembler<(ReplyHeader, ByteOrder)>,
    /// Ordering-preserving worker hand-off, keyed by request id.
    pub in_order: InOrderQueues<Message>,
    clock: Arc<AtomicU64>,
    lru_stamp: AtomicU64,
    purged: AtomicBool,
    negotiated_codesets: parking_lot::Mutex<Option<Bytes>>,
    peer_version: parking_lot::Mutex<Option<(u8, u8)>>,
    /// Fragment chains cancelled while the read task may be parked; the
    /// read loop drains this before arming its progress timeout.
    cancelled_chains: parking_lot::Mutex<HashSet<u32>>,
    unlink: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

static CONN_IDS: AtomicU64 = AtomicU64::new(1);

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn build(
        role: ConnRole,
        label: String,
        contact: Option<ContactInfo>,
        config: TransportConfig,
        clock: Arc<AtomicU64>,
        state: ConnState,
        write_half: Option<OwnedWriteHalf>,
        read_half: Option<OwnedReadHalf>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(state);
        Arc::new(Self {
            id: CONN_IDS.fetch_add(1, Ordering::Relaxed),
            label,
            role,
            contact,
            config,
            state_tx,
            writer: AsyncMutex::new(write_half),
            reader: parking_lot::Mutex::new(read_half),
            next_request_id: AtomicU32::new(1),
            room: ResponseWaitingRoom::new(),
            server_requests: DashMap::new(),
            request_assembler: FragmentAssembler::new(),
            reply_assembler: FragmentAssembler::new(),
            in_order: InOrderQueues::new(),
            clock,
            lru_stamp: AtomicU64::new(0),
            purged: AtomicBool::new(false),
            negotiated_codesets: parking_lot::Mutex::new(None),
            peer_version: parking_lot::Mutex::new(None),
            cancelled_chains: parking_lot::Mutex::new(HashSet::new()),
            unlink: parking_lot::Mutex::new(None),
        })
    }

    /// A fresh monotonic stamp clock for connections that live outside a
    /// cache.
    pub fn private_clock() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(1))
    }

    /// Creates an outbound connection in `Opening`; callers that find it in
    /// a cache block in [`Connection::write_gate`] until the dial finishes.
    pub fn opening(
        contact: ContactInfo,
        config: TransportConfig,
        clock: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Self::build(
            ConnRole::Client,
            contact.to_string(),
            Some(contact),
            config,
            clock,
            ConnState::Opening,
            None,
            None,
        )
    }

    /// Installs the dialed stream and moves `Opening -> Established`.
    pub fn complete_connect(&self, stream: TcpStream) -> TransportResult<()> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock() = Some(read_half);
        // writer slot is empty until now, so try_lock cannot contend
        match self.writer.try_lock() {
            Ok(mut slot) => *slot = Some(write_half),
            Err(_) => {
                return Err(TransportError::Internal(
                    "writer installed while connection was opening".to_string(),
                ))
            }
        }
        if !self.transition(ConnState::Established) {
            return Err(TransportError::Rebind);
        }
        tracing::debug!(conn = self.id, peer = %self.label, "connection established");
        Ok(())
    }

    /// Dials `contact` and returns an established client connection.
    pub async fn connect(
        contact: ContactInfo,
        config: TransportConfig,
        clock: Arc<AtomicU64>,
    ) -> TransportResult<Arc<Self>> {
        let conn = Self::opening(contact.clone(), config.clone(), clock);
        conn.dial(&contact).await?;
        Ok(conn)
    }

    /// Performs the dial for a connection created with [`Connection::opening`].
    pub async fn dial(&self, contact: &ContactInfo) -> TransportResult<()> {
        tracing::debug!(peer = %contact, "connecting");
        let dial = TcpStream::connect(contact.authority());
        let stream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = TransportError::from_io(&e, Completion::No);
                self.purge(err.clone()).await;
                return Err(err);
            }
            Err(_) => {
                let err = TransportError::comm_failure("connect timed out", Completion::No);
                self.purge(err.clone()).await;
                return Err(err);
            }
        };
        self.complete_connect(stream)
    }

    /// Wraps an accepted stream as an established server connection.
    pub fn from_accepted(
        stream: TcpStream,
        peer: std::net::SocketAddr,
        config: TransportConfig,
        clock: Arc<AtomicU64>,
    ) -> Arc<Self> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        Self::build(
            ConnRole::Server,
            peer.to_string(),
            None,
            config,
            clock,
            ConnState::Established,
            Some(write_half),
            Some(read_half),
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> ConnRole {
        self.role
    }

    pub fn contact(&self) -> Option<&ContactInfo> {
        self.contact.as_ref()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    pub fn room(&self) -> &ResponseWaitingRoom {
        &self.room
    }

    /// Guarded forward-only state transition. Returns whether it took.
    pub fn transition(&self, to: ConnState) -> bool {
        self.state_tx.send_if_modified(|state| {
            let allowed = matches!(
                (*state, to),
                (ConnState::Opening, ConnState::Established)
                    | (ConnState::Opening, ConnState::CloseRecvd)
                    | (ConnState::Opening, ConnState::Abort)
                    | (ConnState::Established, ConnState::CloseSent)
                    | (ConnState::Established, ConnState::CloseRecvd)
                    | (ConnState::Established, ConnState::Abort)
                    | (ConnState::CloseSent, ConnState::CloseRecvd)
                    | (ConnState::CloseSent, ConnState::Abort)
            );
            if allowed {
                *state = to;
            }
            allowed
        })
    }

    /// Allocates the next request id, skipping the undefined sentinel.
    pub fn allocate_request_id(&self) -> RequestId {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != RequestId::UNDEFINED.0 {
                return RequestId(id);
            }
        }
    }

    /// Acquires the single-writer gate.
    ///
    /// Blocks while the connection is `Opening`; fails fast with a rebind
    /// classification once the connection is closed.
    pub async fn write_gate(&self) -> TransportResult<WriteGuard<'_>> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnState::Opening => {
                    if state_rx.changed().await.is_err() {
                        return Err(TransportError::ConnectionClosed);
                    }
                }
                ConnState::Established | ConnState::CloseSent => break,
                ConnState::CloseRecvd | ConnState::Abort => return Err(TransportError::Rebind),
            }
        }

        let inner = self.writer.lock().await;
        // the state may have moved while we waited on the mutex
        if self.state().is_closed() {
            return Err(TransportError::Rebind);
        }
        Ok(WriteGuard { conn: self, inner })
    }

    /// Sends one complete message under the write gate.
    pub async fn send_message(&self, message: &Message) -> TransportResult<()> {
        let mut gate = self.write_gate().await?;
        gate.write_all(&message.encode()).await
    }

    /// Sends a multi-part message (initial message plus its fragments)
    /// while holding the write gate across all of them.
    pub async fn send_all(&self, messages: &[Message]) -> TransportResult<()> {
        let mut gate = self.write_gate().await?;
        for message in messages {
            gate.write_all(&message.encode()).await?;
        }
        Ok(())
    }

    /// Registers an in-flight server-side exchange, returning its
    /// cooperative cancellation flag.
    pub fn begin_server_request(&self, id: RequestId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.server_requests.insert(id.0, flag.clone());
        flag
    }

    pub fn end_server_request(&self, id: RequestId) {
        self.server_requests.remove(&id.0);
    }

    /// Marks an in-flight server exchange cancelled. Returns whether a
    /// matching exchange existed and this call performed the transition.
    pub fn cancel_server_request(&self, id: RequestId) -> bool {
        match self.server_requests.get(&id.0) {
            Some(flag) => !flag.swap(true, Ordering::SeqCst),
            None => false,
        }
    }

    /// Bumps the LRU stamp from the cache's monotonic counter. Wall-clock
    /// time is deliberately not used.
    pub fn touch(&self) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.lru_stamp.store(stamp, Ordering::Relaxed);
    }

    pub fn stamp(&self) -> u64 {
        self.lru_stamp.load(Ordering::Relaxed)
    }

    /// Busy connections are never evicted: in-flight requests on either
    /// side, or registered waiters, pin the connection.
    pub fn is_busy(&self) -> bool {
        self.room.has_waiters()
            || !self.server_requests.is_empty()
            || self.request_assembler.open_count() > 0
    }

    /// Installs the cache-removal hook run during purge.
    pub fn set_unlink(&self, f: impl FnOnce() + Send + 'static) {
        *self.unlink.lock() = Some(Box::new(f));
    }

    /// Records the code-set context negotiated from the first request on
    /// this connection. Later contexts do not renegotiate.
    pub fn note_codesets(&self, data: Bytes) {
        let mut slot = self.negotiated_codesets.lock();
        if slot.is_none() {
            *slot = Some(data);
        }
    }

    pub fn codesets(&self) -> Option<Bytes> {
        self.negotiated_codesets.lock().clone()
    }

    /// Records the peer's protocol version from the first request that
    /// carries a version context. Later contexts do not renegotiate.
    pub fn note_peer_version(&self, major: u8, minor: u8) {
        let mut slot = self.peer_version.lock();
        if slot.is_none() {
            *slot = Some((major, minor));
        }
    }

    pub fn peer_version(&self) -> Option<(u8, u8)> {
        *self.peer_version.lock()
    }

    /// Tells the read task to stop expecting fragments for `id`. Cancel
    /// handling runs on a worker, while the framer state that tracks open
    /// chains lives inside the read task.
    pub fn forget_fragments(&self, id: RequestId) {
        self.cancelled_chains.lock().insert(id.0);
    }

    /// Drains the request ids whose fragment chains were cancelled since
    /// the last call.
    pub fn take_cancelled_chains(&self) -> Vec<u32> {
        self.cancelled_chains.lock().drain().collect()
    }

    /// The read half, taken exactly once by the connection's read task.
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().take()
    }

    pub fn is_purged(&self) -> bool {
        self.purged.load(Ordering::SeqCst)
    }

    /// Graceful close: announce `CloseConnection`, then purge.
    pub async fn close(&self) {
        if self.transition(ConnState::CloseSent) {
            let close = Message::new(
                corbel_protocol::MessageKind::CloseConnection,
                corbel_protocol::HeaderFlags::new(),
                Bytes::new(),
            );
            if let Ok(mut gate) = self.write_gate().await {
                let _ = gate.write_all(&close.encode()).await;
            }
        }
        self.purge(TransportError::ConnectionClosed).await;
    }

    /// Tears the connection down exactly once.
    ///
    /// Cancels in-flight server exchanges, broadcasts `err` to every
    /// waiter, unlinks from the owning cache, and shuts the socket down.
    /// The write gate is released last: purge waits for an in-progress
    /// writer instead of deadlocking with it.
    pub async fn purge(&self, err: TransportError) {
        if self.purged.swap(true, Ordering::SeqCst) {
            return;
        }

        let terminal = match err {
            TransportError::ConnectionClosed => ConnState::CloseRecvd,
            _ => ConnState::Abort,
        };
        self.transition(terminal);
        tracing::debug!(conn = self.id, peer = %self.label, state = ?terminal, %err, "purging connection");

        let ids: Vec<u32> = self.server_requests.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, flag)) = self.server_requests.remove(&id) {
                flag.swap(true, Ordering::SeqCst);
            }
        }
        self.request_assembler.clear();
        self.reply_assembler.clear();
        self.in_order.clear();

        self.room.signal_exception_to_all_waiters(&err);

        if let Some(unlink) = self.unlink.lock().take() {
            unlink();
        }

        let _ = self.reader.lock().take();
        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let _ = half.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.label)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Exclusive hold on a connection's outbound byte stream.
pub struct WriteGuard<'a> {
    conn: &'a Connection,
    inner: MutexGuard<'a, Option<OwnedWriteHalf>>,
}

impl WriteGuard<'_> {
    pub async fn write_all(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let half = self
            .inner
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        half.write_all(bytes)
            .await
            .map_err(|e| TransportError::from_io(&e, Completion::Maybe))?;
        self.conn.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corbel_protocol::{HeaderFlags, MessageKind};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let contact = ContactInfo::plain(addr.ip().to_string(), addr.port());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let conn = Connection::connect(
            contact,
            TransportConfig::default(),
            Connection::private_clock(),
        )
        .await
        .unwrap();
        (conn, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (conn, mut peer) = pair().await;
        assert_eq!(conn.state(), ConnState::Established);

        let msg = Message::new(
            MessageKind::CloseConnection,
            HeaderFlags::new(),
            Bytes::new(),
        );
        conn.send_message(&msg).await.unwrap();

        let mut buf = vec![0u8; 12];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[0..4], b"GIOP");
        assert!(conn.stamp() > 0);
    }

    #[tokio::test]
    async fn test_request_id_allocation_skips_sentinel() {
        let (conn, _peer) = pair().await;
        conn.next_request_id
            .store(RequestId::UNDEFINED.0, Ordering::Relaxed);
        let id = conn.allocate_request_id();
        assert!(!id.is_undefined());
    }

    #[tokio::test]
    async fn test_write_gate_fails_fast_after_abort() {
        let (conn, _peer) = pair().await;
        conn.purge(TransportError::comm_failure("boom", Completion::Maybe))
            .await;
        assert_eq!(conn.state(), ConnState::Abort);
        assert!(matches!(
            conn.write_gate().await,
            Err(TransportError::Rebind)
        ));
    }

    #[tokio::test]
    async fn test_purge_runs_exactly_once() {
        let (conn, _peer) = pair().await;
        let receipt = conn.room().register_waiter(RequestId(1)).unwrap();
        let cancel = receipt.cancel_handle();

        conn.purge(TransportError::Rebind).await;
        assert!(cancel.load(Ordering::SeqCst));
        assert!(conn.is_purged());

        // second purge with a different classification is a no-op
        conn.purge(TransportError::ConnectionClosed).await;
        assert_eq!(conn.state(), ConnState::Abort);

        let err = conn
            .room()
            .wait_for_response(receipt, std::time::Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Rebind);
    }

    #[tokio::test]
    async fn test_graceful_close_reaches_close_recvd() {
        let (conn, mut peer) = pair().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnState::CloseRecvd);

        // peer observed the CloseConnection announcement
        let mut buf = vec![0u8; 12];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[7], MessageKind::CloseConnection.as_u8());
    }

    #[tokio::test]
    async fn test_server_request_cancellation() {
        let (conn, _peer) = pair().await;
        let flag = conn.begin_server_request(RequestId(4));
        assert!(conn.is_busy());

        assert!(conn.cancel_server_request(RequestId(4)));
        assert!(flag.load(Ordering::SeqCst));
        // already cancelled: second cancel reports no transition
        assert!(!conn.cancel_server_request(RequestId(4)));
        // unknown id
        assert!(!conn.cancel_server_request(RequestId(99)));

        conn.end_server_request(RequestId(4));
        assert!(!conn.is_busy());
    }

    #[tokio::test]
    async fn test_connect_refused_classified_no() {
        // bind-then-drop gives a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let contact = ContactInfo::plain(addr.ip().to_string(), addr.port());
        let err = Connection::connect(
            contact,
            TransportConfig::default(),
            Connection::private_clock(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.completion(), Some(Completion::No));
    }
}
