//! Classified transport failures.
//!
//! Errors here are the classification the retry machinery consumes, so they
//! must be cloneable: one connection-level fault is broadcast verbatim to
//! every waiter on that connection.

use corbel_protocol::{Completion, ProtocolError, SystemExceptionBody};
use std::time::Duration;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-level failures, classified for retry decisions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// I/O-level failure. `completion` records how far the exchange got.
    #[error("communications failure ({completion:?}): {detail}")]
    CommFailure {
        detail: String,
        completion: Completion,
    },

    /// Synthesized when a response or blocking read did not arrive in time.
    #[error("response timed out after {0:?}")]
    ResponseTimeout(Duration),

    /// The current connection/endpoint must be abandoned and retried.
    #[error("connection must be rebound")]
    Rebind,

    /// Peer closed the connection in an orderly way.
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed wire data; the connection is aborted.
    #[error("framing error: {0}")]
    Framing(String),

    /// A waiter is already registered for this request id.
    #[error("duplicate waiter for request id {0}")]
    DuplicateWaiter(u32),

    /// Non-retryable configuration or wiring problem.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn comm_failure(detail: impl Into<String>, completion: Completion) -> Self {
        TransportError::CommFailure {
            detail: detail.into(),
            completion,
        }
    }

    pub fn from_io(err: &std::io::Error, completion: Completion) -> Self {
        TransportError::CommFailure {
            detail: err.to_string(),
            completion,
        }
    }

    /// Completion status of the failed exchange, where one applies.
    pub fn completion(&self) -> Option<Completion> {
        match self {
            TransportError::CommFailure { completion, .. } => Some(*completion),
            TransportError::ConnectionClosed => Some(Completion::No),
            TransportError::ResponseTimeout(_) => Some(Completion::Maybe),
            _ => None,
        }
    }

    /// Maps this failure onto the wire representation used in
    /// system-exception replies.
    pub fn to_system_exception(&self) -> SystemExceptionBody {
        use corbel_protocol::exception_id;
        match self {
            TransportError::CommFailure { completion, .. } => {
                SystemExceptionBody::new(exception_id::COMM_FAILURE, 1, *completion)
            }
            TransportError::ConnectionClosed => {
                SystemExceptionBody::new(exception_id::COMM_FAILURE, 2, Completion::No)
            }
            TransportError::ResponseTimeout(_) => {
                SystemExceptionBody::new(exception_id::TIMEOUT, 1, Completion::Maybe)
            }
            TransportError::Rebind => {
                SystemExceptionBody::new(exception_id::REBIND, 1, Completion::No)
            }
            TransportError::Framing(_) => {
                SystemExceptionBody::new(exception_id::COMM_FAILURE, 3, Completion::Maybe)
            }
            TransportError::DuplicateWaiter(_) | TransportError::Internal(_) => {
                SystemExceptionBody::new(exception_id::INTERNAL, 1, Completion::No)
            }
        }
    }

    /// Reconstructs a classification from a decoded system-exception body.
    pub fn from_system_exception(body: &SystemExceptionBody) -> Self {
        use corbel_protocol::exception_id;
        match body.exception_id.as_str() {
            exception_id::REBIND | exception_id::TRANSIENT => TransportError::Rebind,
            exception_id::TIMEOUT => {
                TransportError::ResponseTimeout(Duration::from_secs(0))
            }
            exception_id::COMM_FAILURE => TransportError::CommFailure {
                detail: body.exception_id.clone(),
                completion: body.completion,
            },
            other => TransportError::Internal(other.to_string()),
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError::Framing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corbel_protocol::exception_id;

    #[test]
    fn test_completion_classification() {
        let err = TransportError::comm_failure("refused", Completion::No);
        assert_eq!(err.completion(), Some(Completion::No));
        assert_eq!(TransportError::Rebind.completion(), None);
        assert_eq!(
            TransportError::ConnectionClosed.completion(),
            Some(Completion::No)
        );
    }

    #[test]
    fn test_system_exception_roundtrip_classification() {
        let err = TransportError::comm_failure("reset", Completion::No);
        let body = err.to_system_exception();
        assert_eq!(body.exception_id, exception_id::COMM_FAILURE);
        let back = TransportError::from_system_exception(&body);
        assert_eq!(back.completion(), Some(Completion::No));
    }

    #[test]
    fn test_rebind_maps_both_ways() {
        let body = TransportError::Rebind.to_system_exception();
        assert_eq!(body.exception_id, exception_id::REBIND);
        assert_eq!(
            TransportError::from_system_exception(&body),
            TransportError::Rebind
        );
    }
}
