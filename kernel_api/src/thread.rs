//! Execution context lifecycle types

use core_types::{CpuId, PdId, Priority};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an execution context
///
/// Only [`ThreadState::Active`] contexts are eligible to run. Every other
/// state except [`ThreadState::Dead`] is a blocking point that some kernel
/// event leaves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    Active,
    /// Created, not yet started
    AwaitsStart,
    /// Blocked in a call or waiting for a request
    AwaitsIpc,
    /// Paused until explicitly restarted
    AwaitsRestart,
    AwaitsSignal,
    /// Waiting for a delivered signal to be acknowledged so its context can
    /// be destroyed
    AwaitsSignalContextKill,
    Dead,
}

impl ThreadState {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, ThreadState::Active | ThreadState::Dead)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadState::Active => "ACTIVE",
            ThreadState::AwaitsStart => "AWAITS_START",
            ThreadState::AwaitsIpc => "AWAITS_IPC",
            ThreadState::AwaitsRestart => "AWAITS_RESTART",
            ThreadState::AwaitsSignal => "AWAITS_SIGNAL",
            ThreadState::AwaitsSignalContextKill => "AWAITS_SIGNAL_CONTEXT_KILL",
            ThreadState::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// Parameters for creating an execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    pub name: String,
    pub pd: PdId,
    pub cpu: CpuId,
    pub priority: Priority,
    /// Guaranteed ticks per round; zero means fill-only
    pub quota: u64,
}

impl ThreadDescriptor {
    pub fn new(name: impl Into<String>, pd: PdId) -> Self {
        Self {
            name: name.into(),
            pd,
            cpu: CpuId(0),
            priority: Priority::MIN,
            quota: 0,
        }
    }

    pub fn with_cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = quota;
        self
    }
}
