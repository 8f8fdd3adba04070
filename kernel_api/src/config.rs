//! Boot-time kernel configuration

use crate::error::KernelError;
use serde::{Deserialize, Serialize};

/// Parameters the platform layer hands to the kernel at boot
///
/// Every CPU gets its own scheduler built from the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of CPUs, each with an independent scheduler
    pub cpus: usize,
    /// Number of priority bands; valid priorities are `0..priority_levels`
    pub priority_levels: usize,
    /// Ticks per scheduling round (Q)
    pub round_quota: u64,
    /// Ticks of one best-effort slot (F)
    pub fill_quantum: u64,
    /// Default capacity of kernel-side message buffers, in words
    pub message_words: usize,
    /// Record every scheduling decision in an audit log
    pub scheduler_audit: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            priority_levels: 4,
            round_quota: 1000,
            fill_quantum: 100,
            message_words: 64,
            scheduler_audit: false,
        }
    }
}

impl KernelConfig {
    /// Parses and validates a JSON configuration
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|err| KernelError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        let reject = |reason: &str| Err(KernelError::InvalidConfig(reason.to_string()));
        if self.cpus == 0 {
            return reject("at least one CPU is required");
        }
        if self.priority_levels == 0 || self.priority_levels > usize::from(u8::MAX) + 1 {
            return reject("priority_levels must be between 1 and 256");
        }
        if self.round_quota == 0 {
            return reject("round_quota must be nonzero");
        }
        if self.fill_quantum == 0 || self.fill_quantum > self.round_quota {
            return reject("fill_quantum must be nonzero and at most round_quota");
        }
        if self.message_words == 0 {
            return reject("message_words must be nonzero");
        }
        Ok(())
    }
}
