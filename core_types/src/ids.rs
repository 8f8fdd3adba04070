//! Unique identifiers for kernel entities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Handle of an execution context
///
/// Contexts live in a slab owned by the kernel. The generation distinguishes
/// a recycled slot from the context that previously occupied it, so a stale
/// handle never aliases a newer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId {
    index: u32,
    generation: u32,
}

impl ContextId {
    /// Creates a handle from its slab coordinates
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slab slot
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ctx({}.{})", self.index, self.generation)
    }
}

/// Index of a CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuId(pub usize);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cpu({})", self.0)
    }
}

/// Handle of a protection domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PdId(pub u32);

impl fmt::Display for PdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pd({})", self.0)
    }
}

/// Global identity of a kernel object
///
/// Identities are random v4 UUIDs. They are handed out by the kernel when an
/// object is created and are never derived from user-supplied data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity(Uuid);

impl ObjectIdentity {
    /// Creates a fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ObjectIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.0)
    }
}

/// Capability selector, meaningful only inside one protection domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalName(pub u64);

impl LocalName {
    /// Name that never resolves
    pub const INVALID: LocalName = LocalName(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for LocalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}
