//! # Core Types
//!
//! This crate defines the fundamental types shared by every layer of the
//! kernel core: identifiers, priorities and capability spaces.
//!
//! ## Philosophy
//!
//! - **No ambient authority**: an object can only be named through a
//!   capability held in the caller's own capability space.
//! - **Identity is unforgeable**: object identities are random 128-bit values
//!   that user code never fabricates, only receives.
//! - **Names are local**: the same object has unrelated local names in
//!   different protection domains.
//!
//! ## Key Types
//!
//! - [`ContextId`]: Handle of an execution context inside the kernel arena
//! - [`CpuId`]: Index of a CPU
//! - [`PdId`]: Handle of a protection domain
//! - [`ObjectIdentity`]: Global, unforgeable identity of a kernel object
//! - [`LocalName`]: Per-domain capability selector
//! - [`CapRef`]: A resolved capability (identity plus local name)
//! - [`CapSpace`]: The capability table of one protection domain
//! - [`Priority`]: Scheduling priority band

pub mod capability;
pub mod ids;
pub mod priority;

pub use capability::{CapRef, CapSpace, CapabilityError};
pub use ids::{ContextId, CpuId, LocalName, ObjectIdentity, PdId};
pub use priority::Priority;
