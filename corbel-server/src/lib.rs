//! # corbel-server
//!
//! Server side of the corbel broker.
//!
//! This crate provides:
//! - The accept loop and inbound connection registry
//! - Worker-pool dispatch with per-request-id ordering
//! - The request pipeline (adapters, servants, interceptors)
//! - Locate probes and request cancellation
//! - Configuration from YAML and environment variables

pub mod adapter;
pub mod config;
pub mod error;
pub mod mediator;
pub mod server;

pub use adapter::{
    CallContext, Intercept, Interceptor, MapAdapter, ObjectAdapter, Resolution, Servant,
    ServantReply,
};
pub use config::{Config, NetworkConfig, ReadStrategySetting, TransportSettings};
pub use error::{ConfigError, ServerError, ServerResult};
pub use mediator::ServerMediator;
pub use server::{Server, ServerHandle};
