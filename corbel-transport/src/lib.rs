//! # corbel-transport
//!
//! The connection engine: transport channels with an explicit lifecycle,
//! selectable read strategies, fragment reassembly with in-order hand-off,
//! request/response correlation, and pooled connections with
//! high-water-mark eviction.

pub mod cache;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod fragments;
pub mod reader;
pub mod waiting;
pub mod workers;

pub use cache::{InboundConnectionCache, OutboundConnectionCache};
pub use config::{BackoffConfig, ReadStrategy, TransportConfig};
pub use connection::{ConnRole, ConnState, Connection, WriteGuard};
pub use endpoint::{ContactInfo, TargetProfile, TransportKind};
pub use error::{TransportError, TransportResult};
pub use fragments::{FragmentAssembler, InOrderQueues};
pub use reader::{run_read_loop, Inbound};
pub use waiting::{PendingReply, ResponseWaitingRoom, WaitReceipt};
pub use workers::WorkerPool;
