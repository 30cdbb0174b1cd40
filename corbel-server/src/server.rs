//! The accept loop and dispatch plumbing.
//!
//! Accepted connections are registered in the inbound cache and get a read
//! task; decoded messages flow through one dispatch queue into the worker
//! pool. Messages of the same request id are handed to workers in strict
//! arrival order via the connection's in-order queues.

use crate::adapter::ObjectAdapter;
use crate::config::Config;
use crate::error::ServerResult;
use crate::mediator::ServerMediator;
use corbel_protocol::RequestId;
use corbel_transport::{
    run_read_loop, Connection, Inbound, InboundConnectionCache, WorkerPool,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

pub struct Server {
    config: Config,
    mediator: Arc<ServerMediator>,
}

impl Server {
    pub fn new(config: Config, adapter: Arc<dyn ObjectAdapter>) -> Self {
        Self {
            config,
            mediator: Arc::new(ServerMediator::new(adapter)),
        }
    }

    /// Builds a server around a pre-assembled mediator (interceptors etc).
    pub fn with_mediator(config: Config, mediator: ServerMediator) -> Self {
        Self {
            config,
            mediator: Arc::new(mediator),
        }
    }

    /// Binds and starts serving. Returns once the listener is live.
    pub async fn start(self) -> ServerResult<ServerHandle> {
        let transport = self.config.transport();
        let listener = TcpListener::bind(self.config.network.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening");

        let cache = Arc::new(InboundConnectionCache::new(transport.clone()));
        let pool = Arc::new(WorkerPool::new(
            transport.worker_count,
            transport.queue_depth,
        ));
        let (events_tx, events_rx) = mpsc::channel(transport.queue_depth);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(dispatch_loop(events_rx, pool, self.mediator.clone()));

        let accept_cache = cache.clone();
        let max_connections = self.config.network.max_connections;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if accept_cache.len() >= max_connections {
                                    tracing::warn!(%peer, "connection limit reached, refusing");
                                    continue;
                                }
                                tracing::debug!(%peer, "accepted connection");
                                let conn = Connection::from_accepted(
                                    stream,
                                    peer,
                                    transport.clone(),
                                    accept_cache.clock(),
                                );
                                accept_cache.insert(conn.clone()).await;
                                tokio::spawn(run_read_loop(conn, events_tx.clone()));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
            tracing::debug!("accept loop exiting");
        });

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
            cache,
        })
    }
}

async fn dispatch_loop(
    mut events: mpsc::Receiver<Inbound>,
    pool: Arc<WorkerPool>,
    mediator: Arc<ServerMediator>,
) {
    while let Some(Inbound { conn, message }) = events.recv().await {
        let Some(raw_id) = message.peek_request_id() else {
            tracing::warn!(conn = conn.id(), kind = ?message.kind(), "message without request id, dropping");
            continue;
        };
        let id = RequestId(raw_id);

        // first submitter for an id becomes its bound worker; later
        // messages for the same id queue behind it
        let Some(first) = conn.in_order.submit(id, message) else {
            continue;
        };
        let mediator = mediator.clone();
        let worker_conn = conn.clone();
        let submitted = pool
            .submit(async move {
                let mut message = first;
                loop {
                    mediator.handle(worker_conn.clone(), message).await;
                    match worker_conn.in_order.next(id) {
                        Some(next) => message = next,
                        None => break,
                    }
                }
            })
            .await;
        if submitted.is_err() {
            tracing::warn!("dispatch queue unavailable, stopping dispatcher");
            return;
        }
    }
}

/// Running server; shut down via [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    cache: Arc<InboundConnectionCache>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.cache.len()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        self.cache.close_all().await;
        tracing::info!("server stopped");
    }
}
