//! Execution contexts and their lifecycle
//!
//! A context owns one scheduling share on its CPU. It enters the scheduler
//! when started and leaves it whenever it blocks. While it is blocked as a
//! client it may lend its share to the server it waits for; see
//! [`SimulatedKernel::effective_priority`] and
//! [`SimulatedKernel::executing`].

use crate::ipc_node::IpcNode;
use crate::scheduler::ShareId;
use crate::SimulatedKernel;
use core_types::{ContextId, CpuId, ObjectIdentity, PdId, Priority};
use ipc::{CancelReason, Msgbuf};
use kernel_api::{KernelError, SignalContextId, SignalDelivery, SignalReceiverId, ThreadDescriptor, ThreadState};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Result of a blocking operation that has completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A server received a request
    Request {
        caller: ObjectIdentity,
        message: Msgbuf,
    },
    /// A client received its reply
    Reply(Msgbuf),
    Signal(SignalDelivery),
    /// The signal context this context was destroying is gone
    SignalContextKilled,
    /// A paused context was resumed
    Restarted,
    /// The wait was abandoned
    Cancelled(CancelReason),
}

/// What a kernel call that may block did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Finished without blocking
    Done(Completion),
    /// The caller blocked; its completion will be parked in its record
    Blocked,
}

#[derive(Debug)]
pub(crate) struct Thread {
    pub(crate) name: String,
    pub(crate) pd: PdId,
    pub(crate) cpu: CpuId,
    pub(crate) priority: Priority,
    pub(crate) identity: ObjectIdentity,
    pub(crate) state: ThreadState,
    pub(crate) share: ShareId,
    pub(crate) ipc: IpcNode,
    pub(crate) signal_wait: Option<SignalReceiverId>,
    pub(crate) killing: Option<SignalContextId>,
    pub(crate) completion: Option<Completion>,
}

impl SimulatedKernel {
    pub(crate) fn thread(&self, ctx: ContextId) -> Result<&Thread, KernelError> {
        self.threads.get(ctx).ok_or(KernelError::UnknownContext(ctx))
    }

    pub(crate) fn thread_mut(&mut self, ctx: ContextId) -> Result<&mut Thread, KernelError> {
        self.threads
            .get_mut(ctx)
            .ok_or(KernelError::UnknownContext(ctx))
    }

    pub(crate) fn require_state(
        &self,
        ctx: ContextId,
        expected: ThreadState,
        operation: &'static str,
    ) -> Result<&Thread, KernelError> {
        let thread = self.thread(ctx)?;
        if thread.state != expected {
            return Err(KernelError::InvalidState {
                context: ctx,
                state: thread.state,
                operation,
            });
        }
        Ok(thread)
    }

    /// Creates a context in `AwaitsStart`
    pub fn create_thread(&mut self, descriptor: ThreadDescriptor) -> Result<ContextId, KernelError> {
        self.pd(descriptor.pd)?;
        let levels = self.config.priority_levels;
        if descriptor.priority.level() >= levels {
            return Err(KernelError::InvalidPriority {
                priority: descriptor.priority,
                levels,
            });
        }
        let cpu = self.cpus.get_mut(descriptor.cpu)?;
        let share = cpu
            .scheduler
            .insert(descriptor.priority, descriptor.quota);
        let identity = ObjectIdentity::new();
        let ctx = self.threads.insert(Thread {
            name: descriptor.name,
            pd: descriptor.pd,
            cpu: descriptor.cpu,
            priority: descriptor.priority,
            identity,
            state: ThreadState::AwaitsStart,
            share,
            ipc: IpcNode::default(),
            signal_wait: None,
            killing: None,
            completion: None,
        });
        self.owners.insert((descriptor.cpu, share), ctx);
        self.identities.insert(identity, ctx);
        debug!(thread = %ctx, cpu = %descriptor.cpu, priority = %descriptor.priority, quota = descriptor.quota, "thread created");
        Ok(ctx)
    }

    pub fn start_thread(&mut self, ctx: ContextId) -> Result<(), KernelError> {
        self.require_state(ctx, ThreadState::AwaitsStart, "start_thread")?;
        self.wake(ctx);
        debug!(thread = %ctx, "thread started");
        Ok(())
    }

    /// Parks an active context until it is resumed or its timeout expires
    pub fn pause_thread(&mut self, ctx: ContextId) -> Result<(), KernelError> {
        self.require_state(ctx, ThreadState::Active, "pause_thread")?;
        self.become_inactive(ctx, ThreadState::AwaitsRestart);
        debug!(thread = %ctx, "thread paused");
        Ok(())
    }

    /// Unblocks a context, whatever it waits for
    ///
    /// A paused context completes with [`Completion::Restarted`]; any other
    /// blocked context completes with [`CancelReason::Aborted`]. Returns
    /// whether the context was blocked. Resuming a context that is not
    /// blocked does nothing.
    pub fn resume_thread(&mut self, ctx: ContextId) -> Result<bool, KernelError> {
        let resumed = self.interrupt(ctx, CancelReason::Aborted)?;
        if resumed {
            debug!(thread = %ctx, "thread resumed");
        }
        Ok(resumed)
    }

    /// Forces a blocked context back to `Active`
    pub(crate) fn interrupt(
        &mut self,
        ctx: ContextId,
        reason: CancelReason,
    ) -> Result<bool, KernelError> {
        let state = self.thread(ctx)?.state;
        let completion = match state {
            ThreadState::Active | ThreadState::AwaitsStart | ThreadState::Dead => return Ok(false),
            ThreadState::AwaitsRestart if reason == CancelReason::Aborted => Completion::Restarted,
            ThreadState::AwaitsRestart => Completion::Cancelled(reason),
            ThreadState::AwaitsIpc => {
                self.cancel_ipc(ctx, reason);
                return Ok(true);
            }
            ThreadState::AwaitsSignal => {
                self.abandon_signal_wait(ctx);
                Completion::Cancelled(reason)
            }
            ThreadState::AwaitsSignalContextKill => {
                self.abandon_signal_kill(ctx);
                Completion::Cancelled(reason)
            }
        };
        self.thread_mut(ctx)?.completion = Some(completion);
        self.wake(ctx);
        Ok(true)
    }

    /// Terminates a context
    ///
    /// Every client waiting on it completes with
    /// [`CancelReason::PartnerGone`]. Its share leaves the scheduler for
    /// good. Killing a dead context does nothing.
    pub fn kill_thread(&mut self, ctx: ContextId) -> Result<(), KernelError> {
        let (state, cpu, share) = {
            let thread = self.thread(ctx)?;
            (thread.state, thread.cpu, thread.share)
        };
        if state == ThreadState::Dead {
            return Ok(());
        }
        self.cpus.get_mut(cpu)?.timer.cancel(ctx);

        match state {
            ThreadState::AwaitsIpc => self.detach_client(ctx),
            ThreadState::AwaitsSignal => self.abandon_signal_wait(ctx),
            ThreadState::AwaitsSignalContextKill => self.abandon_signal_kill(ctx),
            _ => {}
        }

        let partners = self.clients_of(ctx);
        for client in &partners {
            self.cancel_ipc(*client, CancelReason::PartnerGone);
        }
        if let Ok(thread) = self.thread_mut(ctx) {
            thread.ipc.queue.clear();
            thread.ipc.caller = None;
            thread.ipc.helpers.clear();
            thread.ipc.role = Default::default();
        }

        self.become_inactive(ctx, ThreadState::Dead);
        let scheduler = &mut self.cpus.get_mut(cpu)?.scheduler;
        if scheduler.is_ready(share) {
            scheduler.unready(share);
        }
        if scheduler.head() == share {
            scheduler.update(0);
        }
        scheduler.remove(share);
        self.owners.remove(&(cpu, share));
        debug!(thread = %ctx, partners = partners.len(), "thread killed");
        Ok(())
    }

    /// Frees the record of a dead context
    pub fn destroy_thread(&mut self, ctx: ContextId) -> Result<(), KernelError> {
        self.require_state(ctx, ThreadState::Dead, "destroy_thread")?;
        if let Some(thread) = self.threads.remove(ctx) {
            self.identities.remove(&thread.identity);
            debug!(thread = %ctx, name = %thread.name, "thread destroyed");
        }
        Ok(())
    }

    pub fn set_quota(&mut self, ctx: ContextId, quota: u64) -> Result<(), KernelError> {
        let thread = self.thread(ctx)?;
        if thread.state == ThreadState::Dead {
            return Err(KernelError::InvalidState {
                context: ctx,
                state: thread.state,
                operation: "set_quota",
            });
        }
        let (cpu, share) = (thread.cpu, thread.share);
        self.cpus.get_mut(cpu)?.scheduler.set_quota(share, quota);
        Ok(())
    }

    /// Gives up the rest of the current turn
    ///
    /// If `handoff` names a paused context of the same protection domain, it
    /// is restarted first.
    pub fn yield_thread(
        &mut self,
        ctx: ContextId,
        handoff: Option<ContextId>,
    ) -> Result<(), KernelError> {
        let (pd, cpu) = {
            let thread = self.require_state(ctx, ThreadState::Active, "yield_thread")?;
            (thread.pd, thread.cpu)
        };
        if let Some(target) = handoff {
            let eligible = self
                .thread(target)
                .map(|thread| thread.pd == pd && thread.state == ThreadState::AwaitsRestart)
                .unwrap_or(false);
            if eligible {
                self.thread_mut(target)?.completion = Some(Completion::Restarted);
                self.wake(target);
                trace!(thread = %ctx, target = %target, "handing off");
            }
        }
        self.cpus.get_mut(cpu)?.scheduler.yield_head();
        Ok(())
    }

    /// Takes the parked result of the context's last blocking operation
    pub fn take_completion(&mut self, ctx: ContextId) -> Option<Completion> {
        self.threads
            .get_mut(ctx)
            .and_then(|thread| thread.completion.take())
    }

    /// Highest priority among the ready shares running on behalf of `ctx`
    ///
    /// `None` unless `ctx` is active.
    pub fn effective_priority(&self, ctx: ContextId) -> Result<Option<Priority>, KernelError> {
        let thread = self.thread(ctx)?;
        if thread.state != ThreadState::Active {
            return Ok(None);
        }
        let scheduler = &self.cpus.get(thread.cpu)?.scheduler;
        Ok(self
            .used_shares(ctx)
            .into_iter()
            .filter(|(_, share)| scheduler.is_ready(*share))
            .filter_map(|(_, share)| scheduler.priority(share))
            .max())
    }

    /// The context that actually runs when `ctx`'s share is selected
    ///
    /// Follows the chain of loans from client to server.
    pub fn helping_sink(&self, ctx: ContextId) -> ContextId {
        let mut current = ctx;
        let mut visited = HashSet::new();
        while visited.insert(current) {
            let Some(thread) = self.threads.get(current) else {
                break;
            };
            match thread.ipc.lent_to {
                Some(server) if thread.state == ThreadState::AwaitsIpc => current = server,
                _ => break,
            }
        }
        current
    }

    /// Own share plus the shares of every context lending to `ctx`,
    /// transitively
    pub(crate) fn used_shares(&self, ctx: ContextId) -> Vec<(CpuId, ShareId)> {
        let mut shares = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![ctx];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(thread) = self.threads.get(current) {
                shares.push((thread.cpu, thread.share));
                stack.extend(thread.ipc.helpers.iter().copied());
            }
        }
        shares
    }

    fn activate_used_shares(&mut self, ctx: ContextId) {
        for (cpu, share) in self.used_shares(ctx) {
            if let Ok(cpu) = self.cpus.get_mut(cpu) {
                if cpu.scheduler.contains(share) && !cpu.scheduler.is_ready(share) {
                    cpu.scheduler.ready(share);
                }
            }
        }
    }

    pub(crate) fn deactivate_used_shares(&mut self, ctx: ContextId) {
        for (cpu, share) in self.used_shares(ctx) {
            if let Ok(cpu) = self.cpus.get_mut(cpu) {
                if cpu.scheduler.is_ready(share) {
                    cpu.scheduler.unready(share);
                }
            }
        }
    }

    /// Moves a context to `Active`, putting its shares back if they left
    pub(crate) fn wake(&mut self, ctx: ContextId) {
        let Some(thread) = self.threads.get_mut(ctx) else {
            return;
        };
        if thread.state == ThreadState::Active {
            return;
        }
        let old = thread.state;
        thread.state = ThreadState::Active;
        let cpu = thread.cpu;
        self.activate_used_shares(ctx);
        if let Ok(cpu) = self.cpus.get_mut(cpu) {
            cpu.timer.cancel(ctx);
        }
        trace!(thread = %ctx, from = %old, "thread active");
    }

    /// Moves a context out of `Active`, taking its shares out of the
    /// scheduler
    pub(crate) fn become_inactive(&mut self, ctx: ContextId, state: ThreadState) {
        let Some(thread) = self.threads.get(ctx) else {
            return;
        };
        if thread.state == ThreadState::Active {
            self.deactivate_used_shares(ctx);
        }
        if let Some(thread) = self.threads.get_mut(ctx) {
            trace!(thread = %ctx, from = %thread.state, to = %state, "thread inactive");
            thread.state = state;
        }
    }
}
