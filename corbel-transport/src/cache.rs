//! Connection caches with high-water-mark eviction.
//!
//! Both caches share the same reclamation rule: once the live count exceeds
//! the high-water mark, the least-recently-used idle connections are closed
//! in batches until the count is back under the mark. Recency comes from a
//! monotonic stamp counter shared with the cached connections, never from
//! wall-clock time. Busy connections are never evicted.

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::endpoint::ContactInfo;
use crate::error::TransportResult;
use dashmap::DashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

type OpenHook = Box<dyn Fn(Arc<Connection>) + Send + Sync>;

/// Picks up to `batch` eviction victims: idle connections only, least
/// recent stamp first.
fn select_victims(
    conns: impl Iterator<Item = Arc<Connection>>,
    batch: usize,
) -> Vec<Arc<Connection>> {
    let mut idle: Vec<Arc<Connection>> = conns
        .filter(|c| !c.is_busy() && !c.state().is_closed())
        .collect();
    idle.sort_by_key(|c| c.stamp());
    idle.truncate(batch);
    idle
}

/// Cache of client connections, keyed by contact identity.
///
/// Concurrent callers for the same contact share one connection: the first
/// caller installs an `Opening` placeholder and dials, later callers pick
/// the placeholder up and park in the write gate until the dial settles.
pub struct OutboundConnectionCache {
    config: TransportConfig,
    conns: Arc<DashMap<ContactInfo, Arc<Connection>>>,
    clock: Arc<AtomicU64>,
    on_open: OpenHook,
}

impl OutboundConnectionCache {
    /// `on_open` runs once per freshly established connection, before any
    /// caller can observe it as usable. Callers hang their read task here.
    pub fn new(config: TransportConfig, on_open: impl Fn(Arc<Connection>) + Send + Sync + 'static) -> Self {
        Self {
            config,
            conns: Arc::new(DashMap::new()),
            clock: Connection::private_clock(),
            on_open: Box::new(on_open),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Returns a usable connection to `contact`, dialing if none is cached.
    pub async fn get_or_connect(&self, contact: &ContactInfo) -> TransportResult<Arc<Connection>> {
        loop {
            if let Some(existing) = self.conns.get(contact).map(|e| e.clone()) {
                if existing.is_purged() || existing.state().is_closed() {
                    // stale entry whose unlink has not landed yet
                    let id = existing.id();
                    self.conns.remove_if(contact, |_, v| v.id() == id);
                    continue;
                }
                existing.touch();
                return Ok(existing);
            }

            let (conn, dialer) = match self.conns.entry(contact.clone()) {
                dashmap::mapref::entry::Entry::Occupied(slot) => (slot.get().clone(), false),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let conn =
                        Connection::opening(contact.clone(), self.config.clone(), self.clock.clone());
                    install_unlink(&conn, &self.conns, contact.clone());
                    conn.touch();
                    slot.insert(conn.clone());
                    (conn, true)
                }
            };

            if !dialer {
                // lost the install race; validate the winner's entry
                if conn.is_purged() {
                    continue;
                }
                return Ok(conn);
            }

            conn.dial(contact).await?;
            (self.on_open)(conn.clone());
            self.reclaim().await;
            return Ok(conn);
        }
    }

    /// Brings the live count back under the high-water mark.
    pub async fn reclaim(&self) {
        while self.conns.len() > self.config.cache_high_water_mark {
            let victims = select_victims(
                self.conns.iter().map(|e| e.value().clone()),
                self.config.cache_reclaim_batch,
            );
            if victims.is_empty() {
                // everything live is busy; nothing to do
                return;
            }
            for victim in victims {
                tracing::debug!(conn = victim.id(), peer = %victim.label(), "evicting idle connection");
                victim.close().await;
            }
        }
    }

    pub async fn close_all(&self) {
        let all: Vec<Arc<Connection>> = self.conns.iter().map(|e| e.value().clone()).collect();
        for conn in all {
            conn.close().await;
        }
    }
}

/// Cache of accepted server connections, keyed by connection id.
pub struct InboundConnectionCache {
    config: TransportConfig,
    conns: Arc<DashMap<u64, Arc<Connection>>>,
    clock: Arc<AtomicU64>,
}

impl InboundConnectionCache {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            conns: Arc::new(DashMap::new()),
            clock: Connection::private_clock(),
        }
    }

    pub fn clock(&self) -> Arc<AtomicU64> {
        self.clock.clone()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Registers an accepted connection and reclaims if over the mark.
    pub async fn insert(&self, conn: Arc<Connection>) {
        let conns = self.conns.clone();
        let id = conn.id();
        conn.set_unlink(move || {
            conns.remove(&id);
        });
        conn.touch();
        self.conns.insert(id, conn);
        self.reclaim().await;
    }

    pub async fn reclaim(&self) {
        while self.conns.len() > self.config.cache_high_water_mark {
            let victims = select_victims(
                self.conns.iter().map(|e| e.value().clone()),
                self.config.cache_reclaim_batch,
            );
            if victims.is_empty() {
                return;
            }
            for victim in victims {
                tracing::debug!(conn = victim.id(), peer = %victim.label(), "evicting idle connection");
                victim.close().await;
            }
        }
    }

    pub async fn close_all(&self) {
        let all: Vec<Arc<Connection>> = self.conns.iter().map(|e| e.value().clone()).collect();
        for conn in all {
            conn.close().await;
        }
    }
}

fn install_unlink(
    conn: &Arc<Connection>,
    conns: &Arc<DashMap<ContactInfo, Arc<Connection>>>,
    key: ContactInfo,
) {
    let conns = conns.clone();
    let id = conn.id();
    conn.set_unlink(move || {
        conns.remove_if(&key, |_, v| v.id() == id);
    });
}
