//! Scheduling priority bands

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority band of a scheduling context
///
/// Higher values win. The number of bands is a per-kernel configuration; the
/// scheduler rejects priorities outside its configured range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const MIN: Priority = Priority(0);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Band index for per-priority tables
    pub const fn level(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}
