//! # Kernel API
//!
//! This crate defines the vocabulary shared between the kernel core and the
//! code that drives it: errors, execution-context states, time and the boot
//! configuration.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Execution contexts are created explicitly from a descriptor
//! - Communication is a synchronous rendezvous, nothing else
//! - Time is counted in scheduler ticks and advanced explicitly
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - POSIX (no fork, exec, files)
//! - A binary syscall ABI

pub mod config;
pub mod error;
pub mod signal;
pub mod thread;
pub mod time;

pub use config::KernelConfig;
pub use error::KernelError;
pub use signal::{SignalContextId, SignalDelivery, SignalReceiverId};
pub use thread::{ThreadDescriptor, ThreadState};
pub use time::{Duration, Instant};
