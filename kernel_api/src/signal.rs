//! Signal object identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// A signal receiver: the object handlers wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalReceiverId(pub u32);

/// A signal context: a source of signals bound to one receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalContextId(pub u32);

impl fmt::Display for SignalReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigRecv({})", self.0)
    }
}

impl fmt::Display for SignalContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigCtx({})", self.0)
    }
}

/// What a handler receives when a signal is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub context: SignalContextId,
    /// Opaque value chosen when the context was created
    pub imprint: u64,
    /// Submissions coalesced into this delivery
    pub count: u32,
}
