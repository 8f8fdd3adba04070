//! IPC error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a blocked IPC operation was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// An external authority cancelled the wait
    Aborted,
    /// The partner of the exchange died
    PartnerGone,
    /// A timeout attached to the wait expired
    TimedOut,
}

/// Errors from marshalling into or out of a message buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MarshalError {
    /// Appending would exceed the buffer's word capacity
    #[error("Message buffer full: {needed} words needed, {available} available")]
    BufferFull { needed: usize, available: usize },

    /// More capabilities than a message can carry
    #[error("Too many capabilities in message (limit {limit})")]
    TooManyCaps { limit: usize },

    /// Reading past the end of the delivered words
    #[error("Message exhausted at word {position}")]
    Exhausted { position: usize },

    /// A capability marker referenced a slot the message does not carry
    #[error("Capability slot {slot} out of range")]
    BadCapSlot { slot: usize },

    /// A word did not decode as the requested type
    #[error("Wrong kind of value at word {position}")]
    WrongKind { position: usize },
}

/// Errors surfaced by the rendezvous contract
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    /// The destination name does not resolve in the caller's capability space
    #[error("Invalid destination capability")]
    InvalidDestination,

    /// The operation was abandoned before it completed
    #[error("IPC cancelled: {0:?}")]
    Cancelled(CancelReason),

    /// The caller is not in a state that permits the operation
    #[error("IPC operation not permitted: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl IpcError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, IpcError::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_error_converts() {
        let err: IpcError = MarshalError::TooManyCaps { limit: 4 }.into();
        assert!(matches!(err, IpcError::Marshal(_)));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_cancellation() {
        assert!(IpcError::Cancelled(CancelReason::PartnerGone).is_cancellation());
        assert_eq!(
            IpcError::Cancelled(CancelReason::Aborted).to_string(),
            "IPC cancelled: Aborted"
        );
    }
}
