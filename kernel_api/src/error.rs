//! Kernel error types

use crate::signal::{SignalContextId, SignalReceiverId};
use crate::thread::ThreadState;
use core_types::{CapabilityError, ContextId, CpuId, PdId, Priority};
use ipc::{IpcError, MarshalError};
use thiserror::Error;

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// No live context has this handle
    #[error("Unknown execution context {0}")]
    UnknownContext(ContextId),

    /// The context's state does not permit the operation
    #[error("{operation} not permitted on {context} in state {state}")]
    InvalidState {
        context: ContextId,
        state: ThreadState,
        operation: &'static str,
    },

    #[error("Unknown CPU {0}")]
    UnknownCpu(CpuId),

    #[error("Unknown protection domain {0}")]
    UnknownPd(PdId),

    /// Priority outside the configured bands
    #[error("Priority {priority} outside {levels} configured levels")]
    InvalidPriority { priority: Priority, levels: usize },

    #[error("Unknown signal receiver {0}")]
    UnknownSignalReceiver(SignalReceiverId),

    #[error("Unknown signal context {0}")]
    UnknownSignalContext(SignalContextId),

    /// Configuration rejected at boot
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl From<MarshalError> for KernelError {
    fn from(err: MarshalError) -> Self {
        KernelError::Ipc(IpcError::Marshal(err))
    }
}
