//! Transport tuning knobs.

use corbel_protocol::{FramerConfig, DEFAULT_MAX_MESSAGE_SIZE};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// How a connection's inbound bytes are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    /// Non-blocking reads feeding the framer, with a bounded blocking read
    /// as the fallback waiter so the shared event loop is not starved.
    #[default]
    Optimized,
    /// A per-connection reader task performing ordinary blocking reads.
    Dedicated,
}

/// Connect/backoff budget shared by endpoint retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First wait before a retry.
    pub initial_wait: Duration,
    /// Multiplier applied to the wait after each retry (x100; 150 = 1.5x).
    pub multiplier_pct: u32,
    /// Cap on any single wait.
    pub max_wait: Duration,
    /// Total time budget across all retries of one call.
    pub total_budget: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(100),
            multiplier_pct: 200,
            max_wait: Duration::from_secs(3),
            total_budget: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// The wait following `current`, grown by the multiplier and capped.
    pub fn next_wait(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.multiplier_pct as f64 / 100.0);
        grown.min(self.max_wait)
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Hard cap on one message (header + body); also the read-buffer growth cap.
    pub max_message_size: usize,
    /// Outbound payloads above this size are split into fragments.
    pub fragment_threshold: usize,
    /// How long a caller waits for a reply.
    pub response_timeout: Duration,
    /// Connect timeout per endpoint attempt.
    pub connect_timeout: Duration,
    /// Abort the connection when a partially received message makes no
    /// progress for this long.
    pub progress_timeout: Duration,
    /// Retry backoff budget.
    pub backoff: BackoffConfig,
    /// Read strategy for new connections.
    pub read_strategy: ReadStrategy,
    /// Connection-cache high-water mark (per cache).
    pub cache_high_water_mark: usize,
    /// Connections reclaimed per eviction batch.
    pub cache_reclaim_batch: usize,
    /// Worker tasks consuming the event queue.
    pub worker_count: usize,
    /// Bound of the readiness-event queue.
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragment_threshold: 64 * 1024,
            response_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            progress_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            read_strategy: ReadStrategy::Optimized,
            cache_high_water_mark: 64,
            cache_reclaim_batch: 8,
            worker_count: 4,
            queue_depth: 256,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_fragment_threshold(mut self, size: usize) -> Self {
        self.fragment_threshold = size;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_progress_timeout(mut self, timeout: Duration) -> Self {
        self.progress_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_read_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.read_strategy = strategy;
        self
    }

    pub fn with_cache_high_water_mark(mut self, hwm: usize) -> Self {
        self.cache_high_water_mark = hwm.max(1);
        self
    }

    pub fn with_cache_reclaim_batch(mut self, batch: usize) -> Self {
        self.cache_reclaim_batch = batch.max(1);
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Framer settings derived from this configuration.
    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig {
            initial_capacity: self.read_buffer_size,
            max_message_size: self.max_message_size,
        }
    }
}
