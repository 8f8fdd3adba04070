//! # Simulated CPU Timer
//!
//! Deterministic per-CPU clock with a deadline queue.
//!
//! ## Philosophy
//!
//! **Determinism enables thorough testing.**
//!
//! The clock only advances when the kernel is told that ticks were
//! consumed. Deadlines that fall due are handed back in deadline order and
//! the kernel decides what expiry means for each context.

use core_types::ContextId;
use kernel_api::{Duration, Instant};
use std::collections::{BTreeMap, HashMap};

/// Clock and deadline queue of one CPU
///
/// # Examples
///
/// ```
/// use core_types::ContextId;
/// use kernel_api::{Duration, Instant};
/// use sim_kernel::timer::SimTimer;
///
/// let ctx = ContextId::from_parts(0, 0);
/// let mut timer = SimTimer::new();
/// timer.schedule(ctx, Instant::from_ticks(50));
///
/// timer.advance(Duration::from_ticks(40));
/// assert!(timer.expire().is_empty());
///
/// timer.advance(Duration::from_ticks(10));
/// assert_eq!(timer.expire(), vec![ctx]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimTimer {
    now: Instant,
    deadlines: BTreeMap<(Instant, u64), ContextId>,
    by_context: HashMap<ContextId, (Instant, u64)>,
    next_seq: u64,
}

impl SimTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time on this CPU
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self, delta: Duration) {
        self.now = self.now + delta;
    }

    /// Arms a deadline for `context`, replacing any earlier one
    pub fn schedule(&mut self, context: ContextId, deadline: Instant) {
        self.cancel(context);
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.deadlines.insert(key, context);
        self.by_context.insert(context, key);
    }

    /// Disarms the deadline of `context`; returns whether one was armed
    pub fn cancel(&mut self, context: ContextId) -> bool {
        match self.by_context.remove(&context) {
            Some(key) => {
                self.deadlines.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn deadline(&self, context: ContextId) -> Option<Instant> {
        self.by_context.get(&context).map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every context whose deadline has passed
    pub fn expire(&mut self) -> Vec<ContextId> {
        let mut expired = Vec::new();
        loop {
            let Some((&(deadline, seq), &context)) = self.deadlines.first_key_value() else {
                break;
            };
            if deadline > self.now {
                break;
            }
            self.deadlines.remove(&(deadline, seq));
            self.by_context.remove(&context);
            expired.push(context);
        }
        expired
    }

    /// Number of armed deadlines
    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }
}
