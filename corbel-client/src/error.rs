//! Client-side failures.

use corbel_protocol::{Completion, ProtocolError};
use corbel_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server raised a system exception that no retry policy covers.
    #[error("remote system exception {exception_id} (minor {minor}, {completion:?})")]
    RemoteException {
        exception_id: String,
        minor: u32,
        completion: Completion,
    },

    /// The backoff budget for one invocation ran out.
    #[error("retry budget of {0:?} exhausted")]
    RetryBudgetExhausted(Duration),

    /// Every candidate endpoint, including the root-profile retry, failed.
    #[error("all endpoints for the target failed: {last}")]
    EndpointsExhausted { last: TransportError },

    /// The exchange was cancelled before a reply arrived.
    #[error("invocation cancelled")]
    Cancelled,

    /// The target profile carries no endpoint at all.
    #[error("target profile has no contacts")]
    NoContacts,
}
