//! Per-CPU two-level scheduler
//!
//! ## Philosophy
//!
//! - **Guarantees first**: every share with a quota gets that many ticks per
//!   round, in priority order, before anything else runs.
//! - **Nobody starves**: all ready shares, quota or not, take turns in one
//!   best-effort rotation once the claims are spent.
//! - **Determinism**: the same sequence of calls yields the same decisions.
//!
//! ## Design
//!
//! Time is divided into rounds of `round_quota` ticks. A share's *claim* is
//! the part of its quota not yet used this round. Each priority band has two
//! claim queues: shares that are ready and shares that are not. A share that
//! becomes ready with claim left goes to the front of its band, one without
//! claim to the back. Separately, every ready share sits in the *fill*
//! rotation and gets `fill_quantum` ticks whenever it reaches the front.
//!
//! [`CpuScheduler::update`] charges the head for the ticks it consumed and
//! picks the next head: the front of the highest band whose front still has
//! claim, else the front of the fill rotation, else the idle share.
//!
//! Contract violations (readying a ready share, removing the head, touching
//! the idle share) are bugs in the caller and panic.

use crate::arena::{Arena, ArenaKey};
use crate::queue::{Links, Queue};
use core_types::Priority;
use kernel_api::KernelConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Most events the audit log holds; the oldest half goes when it is full
pub const AUDIT_LOG_LIMIT: usize = 4096;

/// Handle of a scheduling share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareId {
    index: u32,
    generation: u32,
}

impl ArenaKey for ShareId {
    fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Share({}.{})", self.index, self.generation)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub priority_levels: usize,
    /// Ticks per round
    pub round_quota: u64,
    /// Ticks per best-effort slot
    pub fill_quantum: u64,
    /// Record decisions in the audit log
    pub audit: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&KernelConfig::default())
    }
}

impl From<&KernelConfig> for SchedulerConfig {
    fn from(config: &KernelConfig) -> Self {
        Self {
            priority_levels: config.priority_levels,
            round_quota: config.round_quota,
            fill_quantum: config.fill_quantum,
            audit: config.scheduler_audit,
        }
    }
}

/// Scheduling event for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    /// A share became head
    HeadSelected {
        share: ShareId,
        quota: u64,
        claims: bool,
    },
    /// Residual ran out and all claims were refilled
    RoundStarted { round: u64 },
}

#[derive(Debug)]
struct Share {
    priority: Priority,
    quota: u64,
    claim: u64,
    fill: u64,
    ready: bool,
}

/// Scheduler of one CPU
#[derive(Debug)]
pub struct CpuScheduler {
    config: SchedulerConfig,
    shares: Arena<ShareId, Share>,
    ready_claims: Vec<Queue>,
    unready_claims: Vec<Queue>,
    fills: Queue,
    claim_links: Links,
    fill_links: Links,
    idle: ShareId,
    head: ShareId,
    head_quota: u64,
    head_claims: bool,
    head_yields: bool,
    residual: u64,
    rounds: u64,
    audit_log: Vec<ScheduleEvent>,
}

impl CpuScheduler {
    /// Creates a scheduler whose idle share is the initial head
    pub fn new(config: SchedulerConfig) -> Self {
        assert!(config.priority_levels > 0, "no priority levels");
        assert!(config.round_quota > 0, "zero round quota");
        let mut shares = Arena::new();
        let idle = shares.insert(Share {
            priority: Priority::MIN,
            quota: 0,
            claim: 0,
            fill: config.fill_quantum,
            ready: false,
        });
        Self {
            ready_claims: vec![Queue::default(); config.priority_levels],
            unready_claims: vec![Queue::default(); config.priority_levels],
            fills: Queue::default(),
            claim_links: Links::default(),
            fill_links: Links::default(),
            idle,
            head: idle,
            head_quota: config.fill_quantum,
            head_claims: false,
            head_yields: false,
            residual: config.round_quota,
            rounds: 0,
            audit_log: Vec::new(),
            shares,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn share(&self, id: ShareId) -> &Share {
        match self.shares.get(id) {
            Some(share) => share,
            None => panic!("unknown {id}"),
        }
    }

    fn share_mut(&mut self, id: ShareId) -> &mut Share {
        match self.shares.get_mut(id) {
            Some(share) => share,
            None => panic!("unknown {id}"),
        }
    }

    /// Adds a share that is not ready yet
    ///
    /// Its claim starts full, so it competes for its quota as soon as it
    /// becomes ready.
    pub fn insert(&mut self, priority: Priority, quota: u64) -> ShareId {
        assert!(
            priority.level() < self.config.priority_levels,
            "{priority} outside {} levels",
            self.config.priority_levels
        );
        let id = self.shares.insert(Share {
            priority,
            quota,
            claim: quota,
            fill: self.config.fill_quantum,
            ready: false,
        });
        if quota > 0 {
            self.claim_links
                .push_front(&mut self.unready_claims[priority.level()], id.index);
        }
        trace!(share = %id, %priority, quota, "share inserted");
        id
    }

    /// Drops a share entirely; the head and the idle share cannot be removed
    pub fn remove(&mut self, id: ShareId) {
        assert!(id != self.idle, "removing the idle share");
        assert!(id != self.head, "removing the head {id}");
        let (ready, quota, level) = {
            let share = self.share(id);
            (share.ready, share.quota, share.priority.level())
        };
        if ready {
            self.fill_links.remove(&mut self.fills, id.index);
        }
        if quota > 0 {
            if ready {
                self.claim_links
                    .remove(&mut self.ready_claims[level], id.index);
            } else {
                self.claim_links
                    .remove(&mut self.unready_claims[level], id.index);
            }
        }
        self.shares.remove(id);
        trace!(share = %id, "share removed");
    }

    /// Makes a share eligible to run
    pub fn ready(&mut self, id: ShareId) {
        assert!(id != self.idle, "readying the idle share");
        let fill_quantum = self.config.fill_quantum;
        let share = self.share_mut(id);
        assert!(!share.ready, "{id} already ready");
        share.ready = true;
        share.fill = fill_quantum;
        let (quota, claim, level) = (share.quota, share.claim, share.priority.level());

        self.fill_links.push_back(&mut self.fills, id.index);
        if quota == 0 {
            return;
        }
        self.claim_links
            .remove(&mut self.unready_claims[level], id.index);
        if claim > 0 {
            self.claim_links
                .push_front(&mut self.ready_claims[level], id.index);
        } else {
            self.claim_links
                .push_back(&mut self.ready_claims[level], id.index);
        }
    }

    /// Makes a share ineligible to run
    ///
    /// The head may be unreadied; it stays head until the next
    /// [`update`](Self::update).
    pub fn unready(&mut self, id: ShareId) {
        assert!(id != self.idle, "unreadying the idle share");
        let share = self.share_mut(id);
        assert!(share.ready, "{id} not ready");
        share.ready = false;
        let (quota, level) = (share.quota, share.priority.level());

        self.fill_links.remove(&mut self.fills, id.index);
        if quota == 0 {
            return;
        }
        self.claim_links
            .remove(&mut self.ready_claims[level], id.index);
        self.claim_links
            .push_back(&mut self.unready_claims[level], id.index);
    }

    /// Readies a share and reports whether the current head is outdated
    ///
    /// Returns `true` if the newly ready share would win the next decision.
    pub fn ready_check(&mut self, id: ShareId) -> bool {
        self.ready(id);
        let share = self.share(id);
        if share.claim == 0 {
            return self.head == self.idle;
        }
        if !self.head_claims {
            return true;
        }
        let head = self.share(self.head);
        if share.priority != head.priority {
            return share.priority > head.priority;
        }
        // Same band: outdated unless the new share is queued behind the head.
        let mut cursor = Some(self.head.index);
        while let Some(index) = cursor {
            if index == id.index {
                return false;
            }
            cursor = self.claim_links.next(index);
        }
        true
    }

    /// Changes a share's quota
    ///
    /// A smaller nonzero quota clamps the remaining claim; zero demotes the
    /// share to best effort; a nonzero quota on a best-effort share promotes
    /// it, with its first claim granted at the next round.
    pub fn set_quota(&mut self, id: ShareId, quota: u64) {
        assert!(id != self.idle, "setting quota of the idle share");
        let share = self.share_mut(id);
        let (old, ready, level) = (share.quota, share.ready, share.priority.level());
        if old > 0 {
            if quota > 0 {
                share.claim = share.claim.min(quota);
            } else {
                share.claim = 0;
                let queue = if ready {
                    &mut self.ready_claims[level]
                } else {
                    &mut self.unready_claims[level]
                };
                self.claim_links.remove(queue, id.index);
            }
        } else if quota > 0 {
            share.claim = 0;
            let queue = if ready {
                &mut self.ready_claims[level]
            } else {
                &mut self.unready_claims[level]
            };
            self.claim_links.push_back(queue, id.index);
        }
        self.share_mut(id).quota = quota;
        trace!(share = %id, old, quota, "quota changed");
    }

    /// Makes the head give up the rest of its turn at the next update
    ///
    /// A claiming head forfeits its remaining claim; if it also leads the
    /// best-effort rotation it moves to the back there too.
    pub fn yield_head(&mut self) {
        self.head_yields = true;
    }

    /// Charges the head for `consumed` ticks and selects the next head
    pub fn update(&mut self, consumed: u64) {
        let consumed = consumed.min(self.head_quota).min(self.residual);
        let yielded = std::mem::take(&mut self.head_yields);
        let remaining = if yielded {
            0
        } else {
            self.head_quota - consumed
        };

        if self.head_claims {
            self.head_claimed(remaining);
        }
        // A yield also gives up the head's best-effort slot.
        if !self.head_claims || yielded {
            self.head_filled(remaining);
        }
        self.consume(consumed);

        if self.claim_for_head() || self.fill_for_head() {
            return;
        }
        self.set_head(self.idle, self.config.fill_quantum, false);
    }

    fn head_claimed(&mut self, remaining: u64) {
        let id = self.head;
        let share = self.share_mut(id);
        if share.quota == 0 {
            return;
        }
        share.claim = share.claim.min(remaining);
        if share.claim > 0 || !share.ready {
            return;
        }
        let level = share.priority.level();
        let queue = &mut self.ready_claims[level];
        self.claim_links.remove(queue, id.index);
        self.claim_links.push_back(queue, id.index);
    }

    fn head_filled(&mut self, remaining: u64) {
        if self.fills.front() != Some(self.head.index) {
            return;
        }
        let fill_quantum = self.config.fill_quantum;
        let id = self.head;
        if remaining > 0 {
            self.share_mut(id).fill = remaining;
        } else {
            self.share_mut(id).fill = fill_quantum;
            self.fill_links.rotate(&mut self.fills);
        }
    }

    fn consume(&mut self, consumed: u64) {
        if self.residual > consumed {
            self.residual -= consumed;
            return;
        }
        self.residual = self.config.round_quota;
        self.rounds += 1;
        for level in 0..self.config.priority_levels {
            for queue in [self.ready_claims[level], self.unready_claims[level]] {
                let mut cursor = queue.front();
                while let Some(index) = cursor {
                    cursor = self.claim_links.next(index);
                    let share = self
                        .shares
                        .key_at(index)
                        .and_then(|id| self.shares.get_mut(id));
                    if let Some(share) = share {
                        share.claim = share.quota;
                    }
                }
            }
        }
        trace!(round = self.rounds, "round started");
        self.record(ScheduleEvent::RoundStarted { round: self.rounds });
    }

    fn claim_for_head(&mut self) -> bool {
        for level in (0..self.config.priority_levels).rev() {
            let Some(id) = self.ready_claims[level]
                .front()
                .and_then(|index| self.shares.key_at(index))
            else {
                continue;
            };
            let claim = self.share(id).claim;
            if claim > 0 {
                self.set_head(id, claim, true);
                return true;
            }
        }
        false
    }

    fn fill_for_head(&mut self) -> bool {
        let Some(id) = self
            .fills
            .front()
            .and_then(|index| self.shares.key_at(index))
        else {
            return false;
        };
        let fill = self.share(id).fill;
        self.set_head(id, fill, false);
        true
    }

    fn set_head(&mut self, id: ShareId, quota: u64, claims: bool) {
        self.head = id;
        self.head_quota = quota;
        self.head_claims = claims;
        trace!(head = %id, quota, claims, "head selected");
        self.record(ScheduleEvent::HeadSelected {
            share: id,
            quota,
            claims,
        });
    }

    fn record(&mut self, event: ScheduleEvent) {
        if !self.config.audit {
            return;
        }
        if self.audit_log.len() >= AUDIT_LOG_LIMIT {
            self.audit_log.drain(..AUDIT_LOG_LIMIT / 2);
        }
        self.audit_log.push(event);
    }

    pub fn head(&self) -> ShareId {
        self.head
    }

    /// Ticks the head may run before the next update
    pub fn head_quota(&self) -> u64 {
        self.head_quota.min(self.residual)
    }

    /// Whether the head runs on its claim rather than a fill slot
    pub fn head_claims(&self) -> bool {
        self.head_claims
    }

    pub fn idle(&self) -> ShareId {
        self.idle
    }

    /// Ticks per round
    pub fn quota(&self) -> u64 {
        self.config.round_quota
    }

    /// Ticks left in the current round
    pub fn residual(&self) -> u64 {
        self.residual
    }

    /// Rounds completed so far
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn contains(&self, id: ShareId) -> bool {
        self.shares.contains(id)
    }

    pub fn is_ready(&self, id: ShareId) -> bool {
        self.shares.get(id).map(|share| share.ready).unwrap_or(false)
    }

    pub fn priority(&self, id: ShareId) -> Option<Priority> {
        self.shares.get(id).map(|share| share.priority)
    }

    pub fn share_quota(&self, id: ShareId) -> Option<u64> {
        self.shares.get(id).map(|share| share.quota)
    }

    pub fn claim(&self, id: ShareId) -> Option<u64> {
        self.shares.get(id).map(|share| share.claim)
    }

    pub fn fill(&self, id: ShareId) -> Option<u64> {
        self.shares.get(id).map(|share| share.fill)
    }

    /// All shares except idle
    pub fn shares(&self) -> impl Iterator<Item = ShareId> + '_ {
        let idle = self.idle;
        self.shares.iter().map(|(id, _)| id).filter(move |id| *id != idle)
    }

    /// Returns the audit log
    pub fn audit_log(&self) -> &[ScheduleEvent] {
        &self.audit_log
    }

    /// Clears the audit log
    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }
}
