//! The simulated kernel as a rendezvous substrate
//!
//! [`SharedKernel`] puts one [`SimulatedKernel`] behind a mutex so that
//! host threads can each drive one execution context through a
//! [`KernelPort`]. A port turns the kernel's non-blocking calls into the
//! blocking [`Rendezvous`] contract: when a call reports
//! [`CallOutcome::Blocked`] the host thread sleeps until the context's
//! completion is parked.
//!
//! Host threads run truly concurrently here. The CPU schedulers still track
//! every state change, so shares and donation can be inspected while the
//! threads talk.

use crate::thread::{CallOutcome, Completion};
use crate::SimulatedKernel;
use core_types::{CapRef, ContextId, ObjectIdentity};
use ipc::{Cancel, CancelReason, IpcError, Msgbuf, Rendezvous};
use kernel_api::{KernelError, ThreadState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, warn};

/// A kernel shared between host threads
#[derive(Debug)]
pub struct SharedKernel {
    kernel: Mutex<SimulatedKernel>,
    changed: Condvar,
}

impl SharedKernel {
    pub fn new(kernel: SimulatedKernel) -> Arc<Self> {
        Arc::new(Self {
            kernel: Mutex::new(kernel),
            changed: Condvar::new(),
        })
    }

    /// Runs `f` on the kernel and wakes every blocked port afterwards
    pub fn with<R>(&self, f: impl FnOnce(&mut SimulatedKernel) -> R) -> R {
        let result = {
            let mut kernel = self.kernel.lock();
            f(&mut *kernel)
        };
        self.changed.notify_all();
        result
    }

    /// Attaches a port to the started context `ctx`
    pub fn port(self: &Arc<Self>, ctx: ContextId) -> Result<KernelPort, KernelError> {
        let identity = self.kernel.lock().thread_identity(ctx)?;
        debug!(thread = %ctx, %identity, "kernel port attached");
        Ok(KernelPort {
            shared: Arc::clone(self),
            ctx,
            identity,
        })
    }
}

fn to_ipc_error(err: KernelError) -> IpcError {
    match err {
        KernelError::Ipc(err) => err,
        other => IpcError::InvalidState(other.to_string()),
    }
}

/// Blocking endpoint of one execution context
#[derive(Debug)]
pub struct KernelPort {
    shared: Arc<SharedKernel>,
    ctx: ContextId,
    identity: ObjectIdentity,
}

impl KernelPort {
    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn shared(&self) -> &Arc<SharedKernel> {
        &self.shared
    }

    /// Gives this port's domain a capability designating `target`
    pub fn grant(&self, target: ObjectIdentity) -> Result<CapRef, IpcError> {
        let ctx = self.ctx;
        self.shared
            .with(|kernel| {
                let pd = kernel.thread_pd(ctx)?;
                kernel.grant(pd, target)
            })
            .map_err(to_ipc_error)
    }

    /// Sleeps until the context's parked completion is available
    fn block_on(&self, kernel: &mut MutexGuard<'_, SimulatedKernel>) -> Completion {
        loop {
            if let Some(completion) = kernel.take_completion(self.ctx) {
                return completion;
            }
            match kernel.thread_state(self.ctx) {
                Ok(ThreadState::Dead) | Err(_) => {
                    return Completion::Cancelled(CancelReason::Aborted)
                }
                Ok(_) => {}
            }
            self.shared.changed.wait(kernel);
        }
    }

    fn finish(
        &self,
        kernel: &mut MutexGuard<'_, SimulatedKernel>,
        outcome: CallOutcome,
    ) -> Completion {
        self.shared.changed.notify_all();
        match outcome {
            CallOutcome::Done(completion) => completion,
            CallOutcome::Blocked => self.block_on(kernel),
        }
    }

    fn into_request(
        completion: Completion,
        request: &mut Msgbuf,
    ) -> Result<ObjectIdentity, IpcError> {
        match completion {
            Completion::Request { caller, message } => {
                *request = message;
                Ok(caller)
            }
            Completion::Cancelled(reason) => Err(IpcError::Cancelled(reason)),
            other => Err(IpcError::InvalidState(format!(
                "unexpected completion {other:?} while waiting for a request"
            ))),
        }
    }
}

impl Rendezvous for KernelPort {
    type Canceller = KernelCanceller;

    fn identity(&self) -> ObjectIdentity {
        self.identity
    }

    fn canceller(&self) -> KernelCanceller {
        KernelCanceller {
            shared: Arc::clone(&self.shared),
            ctx: self.ctx,
        }
    }

    fn client_call(
        &mut self,
        dest: &CapRef,
        request: &Msgbuf,
        reply: &mut Msgbuf,
    ) -> Result<(), IpcError> {
        let mut kernel = self.shared.kernel.lock();
        let outcome = kernel
            .send_request(self.ctx, dest.local_name(), request, reply.capacity())
            .map_err(to_ipc_error)?;
        match self.finish(&mut kernel, outcome) {
            Completion::Reply(message) => {
                *reply = message;
                Ok(())
            }
            Completion::Cancelled(reason) => Err(IpcError::Cancelled(reason)),
            other => Err(IpcError::InvalidState(format!(
                "unexpected completion {other:?} while waiting for a reply"
            ))),
        }
    }

    fn server_wait(&mut self, request: &mut Msgbuf) -> Result<ObjectIdentity, IpcError> {
        let mut kernel = self.shared.kernel.lock();
        let outcome = kernel
            .await_request(self.ctx, request.capacity())
            .map_err(to_ipc_error)?;
        let completion = self.finish(&mut kernel, outcome);
        Self::into_request(completion, request)
    }

    fn server_reply(&mut self, reply: &Msgbuf) {
        let mut kernel = self.shared.kernel.lock();
        if let Err(err) = kernel.send_reply(self.ctx, reply) {
            warn!(thread = %self.ctx, %err, "reply failed");
        }
        self.shared.changed.notify_all();
    }

    fn server_reply_and_wait(
        &mut self,
        reply: &Msgbuf,
        request: &mut Msgbuf,
    ) -> Result<ObjectIdentity, IpcError> {
        let mut kernel = self.shared.kernel.lock();
        let outcome = kernel
            .reply_and_wait(self.ctx, reply, request.capacity())
            .map_err(to_ipc_error)?;
        let completion = self.finish(&mut kernel, outcome);
        Self::into_request(completion, request)
    }
}

/// Cancels the blocking operation of one [`KernelPort`]
#[derive(Debug, Clone)]
pub struct KernelCanceller {
    shared: Arc<SharedKernel>,
    ctx: ContextId,
}

impl Cancel for KernelCanceller {
    fn cancel(&self) -> bool {
        let ctx = self.ctx;
        self.shared
            .with(|kernel| match kernel.thread_state(ctx) {
                Ok(ThreadState::AwaitsIpc) => kernel.resume_thread(ctx).unwrap_or(false),
                _ => false,
            })
    }
}
