//! # corbel-client
//!
//! The invocation path: endpoint candidates with failover and backoff,
//! the client request mediator, and the high-level [`ObjectClient`].

pub mod client;
pub mod contact;
pub mod error;
pub mod mediator;

pub use client::ObjectClient;
pub use contact::{ContactInfoIterator, ContactInfoList, RetryDecision};
pub use error::{ClientError, ClientResult};
pub use mediator::{ClientMediator, Invocation, InvokeOutcome};
