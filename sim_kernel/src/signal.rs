//! Asynchronous notifications
//!
//! A signal receiver is the object handlers block on; signal contexts are
//! the sources bound to it. Submissions to a context coalesce into one
//! delivery. After a delivery the context stays quiet until its handler
//! acknowledges it, and only then may it be delivered again or destroyed.

use crate::thread::{CallOutcome, Completion};
use crate::SimulatedKernel;
use core_types::{ContextId, PdId};
use ipc::CancelReason;
use kernel_api::{KernelError, SignalContextId, SignalDelivery, SignalReceiverId, ThreadState};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct SignalReceiver {
    pd: PdId,
    /// Handlers blocked in `await_signal`, first come first served
    handlers: VecDeque<ContextId>,
    /// Contexts with submissions waiting for a handler
    pending: VecDeque<SignalContextId>,
}

#[derive(Debug)]
struct SignalContext {
    receiver: SignalReceiverId,
    imprint: u64,
    submits: u32,
    /// Delivered and not yet acknowledged
    ack_pending: bool,
    /// Context blocked in `kill_signal_context` on this one
    killer: Option<ContextId>,
    queued: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SignalTable {
    receivers: Vec<Option<SignalReceiver>>,
    contexts: Vec<Option<SignalContext>>,
}

impl SignalTable {
    fn receiver_mut(&mut self, id: SignalReceiverId) -> Result<&mut SignalReceiver, KernelError> {
        self.receivers
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(KernelError::UnknownSignalReceiver(id))
    }

    fn context(&self, id: SignalContextId) -> Result<&SignalContext, KernelError> {
        self.contexts
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(KernelError::UnknownSignalContext(id))
    }

    fn context_mut(&mut self, id: SignalContextId) -> Result<&mut SignalContext, KernelError> {
        self.contexts
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(KernelError::UnknownSignalContext(id))
    }

    fn remove_context(&mut self, id: SignalContextId) -> Option<SignalContext> {
        let context = self.contexts.get_mut(id.0 as usize)?.take()?;
        if let Ok(receiver) = self.receiver_mut(context.receiver) {
            receiver.pending.retain(|pending| *pending != id);
        }
        Some(context)
    }

    /// Pairs queued contexts with waiting handlers
    fn next_delivery(
        &mut self,
        receiver: SignalReceiverId,
    ) -> Option<(ContextId, SignalDelivery)> {
        let slot = self.receiver_mut(receiver).ok()?;
        if slot.handlers.is_empty() {
            return None;
        }
        let id = slot.pending.pop_front()?;
        let handler = slot.handlers.pop_front()?;
        let context = self.context_mut(id).ok()?;
        let delivery = SignalDelivery {
            context: id,
            imprint: context.imprint,
            count: context.submits,
        };
        context.submits = 0;
        context.queued = false;
        context.ack_pending = true;
        Some((handler, delivery))
    }

    fn enqueue(&mut self, id: SignalContextId) -> Result<SignalReceiverId, KernelError> {
        let context = self.context_mut(id)?;
        let receiver = context.receiver;
        if context.queued || context.ack_pending || context.submits == 0 {
            return Ok(receiver);
        }
        context.queued = true;
        self.receiver_mut(receiver)?.pending.push_back(id);
        Ok(receiver)
    }
}

impl SimulatedKernel {
    pub fn create_signal_receiver(&mut self, pd: PdId) -> Result<SignalReceiverId, KernelError> {
        self.pd(pd)?;
        let id = SignalReceiverId(self.signals.receivers.len() as u32);
        self.signals.receivers.push(Some(SignalReceiver {
            pd,
            handlers: VecDeque::new(),
            pending: VecDeque::new(),
        }));
        debug!(receiver = %id, %pd, "signal receiver created");
        Ok(id)
    }

    /// Binds a new signal source to `receiver`; `imprint` is handed back
    /// with every delivery
    pub fn create_signal_context(
        &mut self,
        receiver: SignalReceiverId,
        imprint: u64,
    ) -> Result<SignalContextId, KernelError> {
        self.signals.receiver_mut(receiver)?;
        let id = SignalContextId(self.signals.contexts.len() as u32);
        self.signals.contexts.push(Some(SignalContext {
            receiver,
            imprint,
            submits: 0,
            ack_pending: false,
            killer: None,
            queued: false,
        }));
        debug!(context = %id, %receiver, imprint, "signal context created");
        Ok(id)
    }

    /// Waits for the next signal on `receiver`
    ///
    /// Only handlers of the receiver's own protection domain may wait.
    pub fn await_signal(
        &mut self,
        ctx: ContextId,
        receiver: SignalReceiverId,
    ) -> Result<CallOutcome, KernelError> {
        let pd = self
            .require_state(ctx, ThreadState::Active, "await_signal")?
            .pd;
        let slot = self.signals.receiver_mut(receiver)?;
        if slot.pd != pd {
            warn!(thread = %ctx, %receiver, "signal wait from foreign domain");
            return Err(KernelError::UnknownSignalReceiver(receiver));
        }
        slot.handlers.push_back(ctx);
        if let Some((handler, delivery)) = self.signals.next_delivery(receiver) {
            // The new handler is the only one if a context was pending.
            debug_assert_eq!(handler, ctx);
            return Ok(CallOutcome::Done(Completion::Signal(delivery)));
        }
        self.thread_mut(ctx)?.signal_wait = Some(receiver);
        self.become_inactive(ctx, ThreadState::AwaitsSignal);
        trace!(thread = %ctx, %receiver, "waiting for signal");
        Ok(CallOutcome::Blocked)
    }

    /// Submits `count` signals to `context`
    pub fn submit_signal(&mut self, context: SignalContextId, count: u32) -> Result<(), KernelError> {
        let slot = self.signals.context_mut(context)?;
        if slot.killer.is_some() {
            warn!(%context, "submit to dying signal context ignored");
            return Ok(());
        }
        slot.submits = slot.submits.saturating_add(count);
        let receiver = self.signals.enqueue(context)?;
        self.deliver_signals(receiver);
        Ok(())
    }

    /// Acknowledges the last delivery of `context`
    ///
    /// Finishes a pending destruction, or makes the context deliverable
    /// again if it was submitted to in the meantime.
    pub fn ack_signal(&mut self, context: SignalContextId) -> Result<(), KernelError> {
        let slot = self.signals.context_mut(context)?;
        if !slot.ack_pending {
            return Ok(());
        }
        slot.ack_pending = false;
        if let Some(killer) = slot.killer.take() {
            self.signals.remove_context(context);
            if let Ok(thread) = self.thread_mut(killer) {
                thread.killing = None;
                thread.completion = Some(Completion::SignalContextKilled);
            }
            self.wake(killer);
            debug!(%context, thread = %killer, "signal context destroyed after ack");
            return Ok(());
        }
        let receiver = self.signals.enqueue(context)?;
        self.deliver_signals(receiver);
        Ok(())
    }

    /// Destroys `context`, waiting for its in-flight delivery to be
    /// acknowledged first
    pub fn kill_signal_context(
        &mut self,
        ctx: ContextId,
        context: SignalContextId,
    ) -> Result<CallOutcome, KernelError> {
        self.require_state(ctx, ThreadState::Active, "kill_signal_context")?;
        let slot = self.signals.context_mut(context)?;
        if slot.killer.is_some() {
            warn!(%context, thread = %ctx, "signal context already being killed");
            return Err(KernelError::UnknownSignalContext(context));
        }
        if slot.ack_pending {
            slot.killer = Some(ctx);
            self.thread_mut(ctx)?.killing = Some(context);
            self.become_inactive(ctx, ThreadState::AwaitsSignalContextKill);
            debug!(%context, thread = %ctx, "waiting for ack before kill");
            return Ok(CallOutcome::Blocked);
        }
        self.signals.remove_context(context);
        debug!(%context, thread = %ctx, "signal context destroyed");
        Ok(CallOutcome::Done(Completion::SignalContextKilled))
    }

    /// Destroys a receiver with all its contexts; waiting handlers complete
    /// with [`CancelReason::PartnerGone`]
    pub fn destroy_signal_receiver(&mut self, receiver: SignalReceiverId) -> Result<(), KernelError> {
        let slot = self
            .signals
            .receivers
            .get_mut(receiver.0 as usize)
            .and_then(Option::take)
            .ok_or(KernelError::UnknownSignalReceiver(receiver))?;
        let mut waiters: Vec<ContextId> = slot.handlers.into_iter().collect();
        for entry in self.signals.contexts.iter_mut() {
            if entry.as_ref().is_some_and(|context| context.receiver == receiver) {
                if let Some(context) = entry.take() {
                    waiters.extend(context.killer);
                }
            }
        }
        for ctx in &waiters {
            let finished = match self.threads.get(*ctx).map(|thread| thread.state) {
                Some(ThreadState::AwaitsSignalContextKill) => Completion::SignalContextKilled,
                _ => Completion::Cancelled(CancelReason::PartnerGone),
            };
            if let Ok(thread) = self.thread_mut(*ctx) {
                thread.signal_wait = None;
                thread.killing = None;
                thread.completion = Some(finished);
            }
            self.wake(*ctx);
        }
        debug!(%receiver, woken = waiters.len(), "signal receiver destroyed");
        Ok(())
    }

    fn deliver_signals(&mut self, receiver: SignalReceiverId) {
        while let Some((handler, delivery)) = self.signals.next_delivery(receiver) {
            if let Ok(thread) = self.thread_mut(handler) {
                thread.signal_wait = None;
                thread.completion = Some(Completion::Signal(delivery));
            }
            self.wake(handler);
            trace!(thread = %handler, context = %delivery.context, count = delivery.count, "signal delivered");
        }
    }

    /// Withdraws a handler from the receiver it waits on
    pub(crate) fn abandon_signal_wait(&mut self, ctx: ContextId) {
        let Some(receiver) = self
            .threads
            .get_mut(ctx)
            .and_then(|thread| thread.signal_wait.take())
        else {
            return;
        };
        if let Ok(slot) = self.signals.receiver_mut(receiver) {
            slot.handlers.retain(|handler| *handler != ctx);
        }
    }

    /// Gives up waiting for a signal context to become destroyable
    pub(crate) fn abandon_signal_kill(&mut self, ctx: ContextId) {
        let Some(context) = self
            .threads
            .get_mut(ctx)
            .and_then(|thread| thread.killing.take())
        else {
            return;
        };
        if let Ok(slot) = self.signals.context_mut(context) {
            slot.killer = None;
        }
    }

    /// Submissions not yet delivered for `context`
    pub fn signal_submits(&self, context: SignalContextId) -> Result<u32, KernelError> {
        self.signals.context(context).map(|slot| slot.submits)
    }
}
