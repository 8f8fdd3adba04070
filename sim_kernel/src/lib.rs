//! # Simulated Kernel
//!
//! The kernel core of a capability-based microkernel, run in-process.
//!
//! ## Purpose
//!
//! - One [`scheduler::CpuScheduler`] per CPU, two-level: guaranteed quota
//!   first, best-effort rotation after
//! - Execution contexts with a seven-state lifecycle
//! - Synchronous rendezvous between contexts, addressed by capability, with
//!   the client's share lent to the server for the length of the call
//! - Asynchronous signals and per-context timeouts
//!
//! ## Philosophy
//!
//! **Testability is a first-class design constraint.**
//!
//! Time only moves when [`SimulatedKernel::run_once`] or
//! [`SimulatedKernel::advance_time`] says so, and every decision is
//! deterministic. The kernel takes no locks; [`substrate::SharedKernel`]
//! wraps it for host threads that want to drive contexts concurrently.

mod arena;
mod ipc_node;
mod queue;
pub mod scheduler;
mod signal;
pub mod smp;
pub mod substrate;
pub mod test_utils;
mod thread;
pub mod timer;

pub use scheduler::{CpuScheduler, ScheduleEvent, SchedulerConfig, ShareId};
pub use smp::{Cpu, CpuPool};
pub use substrate::{KernelCanceller, KernelPort, SharedKernel};
pub use thread::{CallOutcome, Completion};

use arena::Arena;
use core_types::{CapRef, CapSpace, ContextId, CpuId, ObjectIdentity, PdId, Priority};
use kernel_api::{Duration, Instant, KernelConfig, KernelError, ThreadState};
use signal::SignalTable;
use std::collections::HashMap;
use thread::Thread;
use tracing::{debug, trace};

/// A protection domain: a label and a capability space
#[derive(Debug)]
pub(crate) struct ProtectionDomain {
    label: String,
    pub(crate) caps: CapSpace,
}

/// Simulated kernel state
///
/// Unlike a real kernel, this state is directly accessible for testing.
#[derive(Debug)]
pub struct SimulatedKernel {
    config: KernelConfig,
    cpus: CpuPool,
    threads: Arena<ContextId, Thread>,
    /// Which context owns each share
    owners: HashMap<(CpuId, ShareId), ContextId>,
    /// Contexts by the identity capabilities designate them with
    identities: HashMap<ObjectIdentity, ContextId>,
    pds: Vec<ProtectionDomain>,
    signals: SignalTable,
}

impl SimulatedKernel {
    /// Boots a kernel with one scheduler per configured CPU
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        config.validate()?;
        let cpus = CpuPool::new(&config);
        debug!(
            cpus = config.cpus,
            levels = config.priority_levels,
            round_quota = config.round_quota,
            "kernel booted"
        );
        Ok(Self {
            config,
            cpus,
            threads: Arena::new(),
            owners: HashMap::new(),
            identities: HashMap::new(),
            pds: Vec::new(),
            signals: SignalTable::default(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn create_pd(&mut self, label: impl Into<String>) -> PdId {
        let id = PdId(self.pds.len() as u32);
        let label = label.into();
        debug!(pd = %id, %label, "protection domain created");
        self.pds.push(ProtectionDomain {
            label,
            caps: CapSpace::new(),
        });
        id
    }

    pub(crate) fn pd(&self, id: PdId) -> Result<&ProtectionDomain, KernelError> {
        self.pds.get(id.0 as usize).ok_or(KernelError::UnknownPd(id))
    }

    pub(crate) fn pd_mut(&mut self, id: PdId) -> Result<&mut ProtectionDomain, KernelError> {
        self.pds
            .get_mut(id.0 as usize)
            .ok_or(KernelError::UnknownPd(id))
    }

    pub fn pd_label(&self, id: PdId) -> Result<&str, KernelError> {
        self.pd(id).map(|pd| pd.label.as_str())
    }

    /// Binds `identity` in the capability space of `pd`
    pub fn grant(&mut self, pd: PdId, identity: ObjectIdentity) -> Result<CapRef, KernelError> {
        let cap = self.pd_mut(pd)?.caps.insert(identity);
        trace!(%pd, %cap, "capability granted");
        Ok(cap)
    }

    /// Resolves a local name in the capability space of `pd`
    pub fn lookup(&self, pd: PdId, cap: &CapRef) -> Result<ObjectIdentity, KernelError> {
        Ok(self.pd(pd)?.caps.lookup(cap.local_name())?)
    }

    pub fn cpus(&self) -> &CpuPool {
        &self.cpus
    }

    pub fn scheduler(&self, cpu: CpuId) -> Result<&CpuScheduler, KernelError> {
        self.cpus.get(cpu).map(|cpu| cpu.scheduler())
    }

    pub fn thread_state(&self, ctx: ContextId) -> Result<ThreadState, KernelError> {
        self.thread(ctx).map(|thread| thread.state)
    }

    /// The identity capabilities to `ctx` designate
    pub fn thread_identity(&self, ctx: ContextId) -> Result<ObjectIdentity, KernelError> {
        self.thread(ctx).map(|thread| thread.identity)
    }

    pub fn thread_pd(&self, ctx: ContextId) -> Result<PdId, KernelError> {
        self.thread(ctx).map(|thread| thread.pd)
    }

    pub fn thread_name(&self, ctx: ContextId) -> Result<&str, KernelError> {
        self.thread(ctx).map(|thread| thread.name.as_str())
    }

    pub fn thread_priority(&self, ctx: ContextId) -> Result<Priority, KernelError> {
        self.thread(ctx).map(|thread| thread.priority)
    }

    /// CPU and share a context was created with
    pub fn thread_share(&self, ctx: ContextId) -> Result<(CpuId, ShareId), KernelError> {
        self.thread(ctx).map(|thread| (thread.cpu, thread.share))
    }

    /// Context that owns `share`, if it still exists
    pub fn share_owner(&self, cpu: CpuId, share: ShareId) -> Option<ContextId> {
        self.owners.get(&(cpu, share)).copied()
    }

    pub fn context_of(&self, identity: ObjectIdentity) -> Option<ContextId> {
        self.identities.get(&identity).copied()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// The context running on `cpu` right now, `None` while idle
    pub fn executing(&self, cpu: CpuId) -> Result<Option<ContextId>, KernelError> {
        let head = self.cpus.get(cpu)?.scheduler.head();
        Ok(self
            .share_owner(cpu, head)
            .map(|owner| self.helping_sink(owner)))
    }

    /// One kernel pass on `cpu`
    ///
    /// Moves the clock by `consumed` ticks, fires due timeouts, charges the
    /// head and picks the next one. Returns the context that runs next.
    pub fn run_once(&mut self, cpu: CpuId, consumed: u64) -> Result<Option<ContextId>, KernelError> {
        self.advance_time(cpu, Duration::from_ticks(consumed))?;
        self.cpus.get_mut(cpu)?.scheduler.update(consumed);
        let next = self.executing(cpu)?;
        trace!(%cpu, consumed, next = ?next, "kernel pass");
        Ok(next)
    }

    /// Moves the clock of `cpu` and fires every deadline that passed
    pub fn advance_time(&mut self, cpu: CpuId, delta: Duration) -> Result<(), KernelError> {
        let timer = &mut self.cpus.get_mut(cpu)?.timer;
        timer.advance(delta);
        let expired = timer.expire();
        for ctx in expired {
            let expired = self
                .interrupt(ctx, ipc::CancelReason::TimedOut)
                .unwrap_or(false);
            debug!(thread = %ctx, %cpu, expired, "timeout");
        }
        Ok(())
    }

    pub fn now(&self, cpu: CpuId) -> Result<Instant, KernelError> {
        self.cpus.get(cpu).map(|cpu| cpu.timer().now())
    }

    /// Arms a timeout `after` ticks from now on the context's CPU
    ///
    /// When it fires while the context is blocked, the wait is abandoned with
    /// [`ipc::CancelReason::TimedOut`]. Any earlier timeout is replaced.
    /// Becoming active cancels it.
    pub fn set_timeout(&mut self, ctx: ContextId, after: Duration) -> Result<Instant, KernelError> {
        let cpu = self.thread(ctx)?.cpu;
        let timer = &mut self.cpus.get_mut(cpu)?.timer;
        let deadline = timer.now() + after;
        timer.schedule(ctx, deadline);
        trace!(thread = %ctx, deadline = deadline.as_ticks(), "timeout armed");
        Ok(deadline)
    }

    /// Disarms the context's timeout; returns whether one was armed
    pub fn cancel_timeout(&mut self, ctx: ContextId) -> Result<bool, KernelError> {
        let cpu = self.thread(ctx)?.cpu;
        Ok(self.cpus.get_mut(cpu)?.timer.cancel(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{spawn_started, test_kernel};
    use ipc::{CancelReason, Msgbuf};
    use kernel_api::ThreadDescriptor;

    #[test]
    fn test_rejects_invalid_config() {
        let config = KernelConfig {
            cpus: 0,
            ..KernelConfig::default()
        };
        assert!(matches!(
            SimulatedKernel::new(config),
            Err(KernelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_idle_cpu_runs_nothing() {
        let mut kernel = test_kernel();
        assert_eq!(kernel.run_once(CpuId(0), 0).unwrap(), None);
    }

    #[test]
    fn test_started_thread_runs() {
        let mut kernel = test_kernel();
        let pd = kernel.create_pd("init");
        let ctx = spawn_started(&mut kernel, pd, "init", Priority::new(1), 100);
        assert_eq!(kernel.run_once(CpuId(0), 0).unwrap(), Some(ctx));
        assert_eq!(kernel.thread_state(ctx).unwrap(), ThreadState::Active);
    }

    #[test]
    fn test_create_validates_descriptor() {
        let mut kernel = test_kernel();
        let pd = kernel.create_pd("init");
        let levels = kernel.config().priority_levels;

        let err = kernel
            .create_thread(ThreadDescriptor::new("t", PdId(7)))
            .unwrap_err();
        assert_eq!(err, KernelError::UnknownPd(PdId(7)));

        let err = kernel
            .create_thread(ThreadDescriptor::new("t", pd).with_cpu(CpuId(9)))
            .unwrap_err();
        assert_eq!(err, KernelError::UnknownCpu(CpuId(9)));

        let priority = Priority::new(levels as u8);
        let err = kernel
            .create_thread(ThreadDescriptor::new("t", pd).with_priority(priority))
            .unwrap_err();
        assert_eq!(err, KernelError::InvalidPriority { priority, levels });
        assert_eq!(kernel.thread_count(), 0);
    }

    #[test]
    fn test_timeout_abandons_pause() {
        let mut kernel = test_kernel();
        let pd = kernel.create_pd("init");
        let ctx = spawn_started(&mut kernel, pd, "sleeper", Priority::MIN, 0);
        kernel.pause_thread(ctx).unwrap();
        let deadline = kernel.set_timeout(ctx, Duration::from_ticks(30)).unwrap();
        assert_eq!(deadline, Instant::from_ticks(30));

        assert_eq!(kernel.run_once(CpuId(0), 20).unwrap(), None);
        assert_eq!(kernel.thread_state(ctx).unwrap(), ThreadState::AwaitsRestart);

        assert_eq!(kernel.run_once(CpuId(0), 10).unwrap(), Some(ctx));
        assert_eq!(
            kernel.take_completion(ctx),
            Some(Completion::Cancelled(CancelReason::TimedOut))
        );
    }

    #[test]
    fn test_waking_disarms_timeout() {
        let mut kernel = test_kernel();
        let pd = kernel.create_pd("init");
        let ctx = spawn_started(&mut kernel, pd, "server", Priority::MIN, 0);
        kernel.await_request(ctx, 4).unwrap();
        kernel.set_timeout(ctx, Duration::from_ticks(5)).unwrap();
        assert!(kernel.resume_thread(ctx).unwrap());
        assert!(!kernel.cancel_timeout(ctx).unwrap());
        kernel.advance_time(CpuId(0), Duration::from_ticks(10)).unwrap();
        assert_eq!(
            kernel.take_completion(ctx),
            Some(Completion::Cancelled(CancelReason::Aborted))
        );
        assert_eq!(kernel.take_completion(ctx), None);
    }

    #[test]
    fn test_grant_and_lookup() {
        let mut kernel = test_kernel();
        let pd = kernel.create_pd("init");
        let ctx = spawn_started(&mut kernel, pd, "server", Priority::MIN, 0);
        let identity = kernel.thread_identity(ctx).unwrap();
        let cap = kernel.grant(pd, identity).unwrap();
        assert_eq!(kernel.lookup(pd, &cap).unwrap(), identity);
        assert_eq!(kernel.context_of(identity), Some(ctx));
        assert_eq!(kernel.pd_label(pd).unwrap(), "init");

        let mut request = Msgbuf::with_capacity(1);
        request.push(&1u64).unwrap();
        assert!(kernel
            .send_request(ctx, cap.local_name(), &request, 1)
            .is_err());
    }
}
