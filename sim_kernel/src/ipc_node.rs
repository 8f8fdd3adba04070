//! Kernel-side rendezvous
//!
//! Each context carries one [`IpcNode`]. A client blocks in
//! [`SimulatedKernel::send_request`] until the server it called answers with
//! [`SimulatedKernel::send_reply`]. Requests that arrive while the server is
//! busy wait in the server's queue in arrival order.
//!
//! While a client waits on a server of the same CPU it lends its share to
//! that server, so the server runs with the client's priority and quota
//! until it replies.

use crate::thread::{CallOutcome, Completion};
use crate::SimulatedKernel;
use core_types::{CapRef, ContextId, LocalName, ObjectIdentity};
use ipc::{CancelReason, IpcError, Msgbuf};
use kernel_api::{KernelError, ThreadState};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// What a context is doing in the rendezvous
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum IpcRole {
    #[default]
    Idle,
    /// Server blocked for the next request
    AwaitRequest { capacity: usize },
    /// Client blocked for a reply
    AwaitReply {
        server: ContextId,
        capacity: usize,
    },
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) client: ContextId,
    pub(crate) message: Msgbuf,
}

#[derive(Debug, Default)]
pub(crate) struct IpcNode {
    pub(crate) role: IpcRole,
    /// Requests not yet taken by this server
    pub(crate) queue: VecDeque<PendingRequest>,
    /// Client whose request this server is handling
    pub(crate) caller: Option<ContextId>,
    /// Clients lending their share to this server
    pub(crate) helpers: Vec<ContextId>,
    /// Server this client lends its share to
    pub(crate) lent_to: Option<ContextId>,
}

impl SimulatedKernel {
    /// Calls the server that `dest` designates in the caller's capability
    /// space
    ///
    /// The request is copied at once. Returns [`CallOutcome::Blocked`] unless
    /// the call fails before the client blocks; the reply, or the reason the
    /// call was abandoned, is then left as the client's completion.
    pub fn send_request(
        &mut self,
        ctx: ContextId,
        dest: LocalName,
        request: &Msgbuf,
        reply_capacity: usize,
    ) -> Result<CallOutcome, KernelError> {
        let (pd, cpu) = {
            let thread = self.require_state(ctx, ThreadState::Active, "send_request")?;
            (thread.pd, thread.cpu)
        };
        let server = self
            .pd(pd)?
            .caps
            .lookup(dest)
            .ok()
            .and_then(|identity| self.identities.get(&identity).copied())
            .ok_or(IpcError::InvalidDestination)?;
        if server == ctx {
            return Err(IpcError::InvalidState("call to own context".into()).into());
        }
        let (server_state, server_cpu) = match self.threads.get(server) {
            Some(thread) => (thread.state, thread.cpu),
            None => return Ok(CallOutcome::Done(Completion::Cancelled(CancelReason::PartnerGone))),
        };
        if server_state == ThreadState::Dead {
            return Ok(CallOutcome::Done(Completion::Cancelled(
                CancelReason::PartnerGone,
            )));
        }

        let message = self.translate(ctx, server, request, request.len());
        self.thread_mut(ctx)?.ipc.role = IpcRole::AwaitReply {
            server,
            capacity: reply_capacity,
        };
        let server_waits = matches!(
            self.thread(server)?.ipc.role,
            IpcRole::AwaitRequest { .. }
        ) && server_state == ThreadState::AwaitsIpc;
        if server_waits {
            self.deliver_request(server, PendingRequest { client: ctx, message });
        } else {
            self.thread_mut(server)?
                .ipc
                .queue
                .push_back(PendingRequest { client: ctx, message });
            trace!(client = %ctx, %server, "request queued");
        }

        self.thread_mut(ctx)?.state = ThreadState::AwaitsIpc;
        let same_cpu = server_cpu == cpu;
        if same_cpu {
            self.thread_mut(server)?.ipc.helpers.push(ctx);
            self.thread_mut(ctx)?.ipc.lent_to = Some(server);
        }
        // A server blocked in a call of its own passes the loan down the chain.
        let sink_active = self.thread(self.helping_sink(server))?.state == ThreadState::Active;
        if !same_cpu || !sink_active {
            self.deactivate_used_shares(ctx);
        }
        debug!(client = %ctx, %server, lent = same_cpu, "client blocked in call");
        Ok(CallOutcome::Blocked)
    }

    /// Takes the next request or blocks until one arrives
    pub fn await_request(
        &mut self,
        ctx: ContextId,
        capacity: usize,
    ) -> Result<CallOutcome, KernelError> {
        self.require_state(ctx, ThreadState::Active, "await_request")?;
        let node = &mut self.thread_mut(ctx)?.ipc;
        node.caller = None;
        if let Some(pending) = node.queue.pop_front() {
            node.role = IpcRole::AwaitRequest { capacity };
            let completion = self.accept_request(ctx, pending);
            return Ok(CallOutcome::Done(completion));
        }
        node.role = IpcRole::AwaitRequest { capacity };
        self.become_inactive(ctx, ThreadState::AwaitsIpc);
        trace!(server = %ctx, "server waiting for requests");
        Ok(CallOutcome::Blocked)
    }

    /// Answers the caller of the request last taken
    ///
    /// A reply whose caller has meanwhile gone away is dropped.
    pub fn send_reply(&mut self, ctx: ContextId, reply: &Msgbuf) -> Result<(), KernelError> {
        self.require_state(ctx, ThreadState::Active, "send_reply")?;
        let Some(client) = self.thread_mut(ctx)?.ipc.caller.take() else {
            warn!(server = %ctx, "reply without caller dropped");
            return Ok(());
        };
        let capacity = match self.threads.get(client) {
            Some(thread) if thread.state == ThreadState::AwaitsIpc => match thread.ipc.role {
                IpcRole::AwaitReply { server, capacity } if server == ctx => capacity,
                _ => {
                    warn!(server = %ctx, %client, "caller no longer waits, reply dropped");
                    return Ok(());
                }
            },
            _ => {
                warn!(server = %ctx, %client, "caller gone, reply dropped");
                return Ok(());
            }
        };
        let message = self.translate(ctx, client, reply, capacity);
        self.detach_client(client);
        if let Ok(thread) = self.thread_mut(client) {
            thread.ipc.role = IpcRole::Idle;
            thread.completion = Some(Completion::Reply(message));
        }
        self.wake(client);
        trace!(server = %ctx, %client, "reply delivered");
        Ok(())
    }

    /// Answers the current caller and takes the next request
    pub fn reply_and_wait(
        &mut self,
        ctx: ContextId,
        reply: &Msgbuf,
        capacity: usize,
    ) -> Result<CallOutcome, KernelError> {
        self.send_reply(ctx, reply)?;
        self.await_request(ctx, capacity)
    }

    /// Number of requests waiting at `server` that it has not taken yet
    pub fn queued_requests(&self, server: ContextId) -> Result<usize, KernelError> {
        Ok(self.thread(server)?.ipc.queue.len())
    }

    /// Abandons whatever rendezvous `ctx` is blocked in and wakes it with
    /// `reason`
    pub(crate) fn cancel_ipc(&mut self, ctx: ContextId, reason: CancelReason) {
        let Some(thread) = self.threads.get(ctx) else {
            return;
        };
        if let IpcRole::AwaitReply { .. } = thread.ipc.role {
            self.detach_client(ctx);
        }
        if let Some(thread) = self.threads.get_mut(ctx) {
            thread.ipc.role = IpcRole::Idle;
            thread.completion = Some(Completion::Cancelled(reason));
        }
        self.wake(ctx);
        debug!(thread = %ctx, ?reason, "rendezvous cancelled");
    }

    /// Unhooks a blocked client from its server: its queued request, the
    /// server's reference to it and its loan
    pub(crate) fn detach_client(&mut self, client: ContextId) {
        let Some(thread) = self.threads.get_mut(client) else {
            return;
        };
        let server = match thread.ipc.role {
            IpcRole::AwaitReply { server, .. } => Some(server),
            _ => None,
        };
        let lent_to = thread.ipc.lent_to.take();
        for server in server.into_iter().chain(lent_to) {
            if let Some(node) = self.threads.get_mut(server).map(|thread| &mut thread.ipc) {
                node.queue.retain(|pending| pending.client != client);
                if node.caller == Some(client) {
                    node.caller = None;
                }
                node.helpers.retain(|helper| *helper != client);
            }
        }
    }

    /// Every client blocked on `server`
    pub(crate) fn clients_of(&self, server: ContextId) -> Vec<ContextId> {
        self.threads
            .iter()
            .filter(|(_, thread)| {
                thread.state == ThreadState::AwaitsIpc
                    && matches!(thread.ipc.role, IpcRole::AwaitReply { server: s, .. } if s == server)
            })
            .map(|(ctx, _)| ctx)
            .collect()
    }

    /// Hands a request to a server blocked in `await_request`
    fn deliver_request(&mut self, server: ContextId, pending: PendingRequest) {
        let completion = self.accept_request(server, pending);
        if let Some(thread) = self.threads.get_mut(server) {
            thread.completion = Some(completion);
        }
        self.wake(server);
    }

    fn accept_request(&mut self, server: ContextId, pending: PendingRequest) -> Completion {
        let caller = self
            .threads
            .get(pending.client)
            .map(|thread| thread.identity)
            .unwrap_or_default();
        let Some(thread) = self.threads.get_mut(server) else {
            return Completion::Cancelled(CancelReason::PartnerGone);
        };
        let capacity = match thread.ipc.role {
            IpcRole::AwaitRequest { capacity } => capacity,
            _ => pending.message.len(),
        };
        let mut message = Msgbuf::with_capacity(capacity);
        let delivery = pending.message.deliver_to(&mut message, |cap| *cap);
        if delivery.truncated {
            trace!(%server, words = delivery.words, "request truncated");
        }
        thread.ipc.caller = Some(pending.client);
        thread.ipc.role = IpcRole::Idle;
        trace!(%server, client = %pending.client, "request delivered");
        Completion::Request { caller, message }
    }

    /// Copies `msg` from `from` into a buffer of `capacity` words and moves
    /// its capabilities from `from`'s space into `to`'s
    pub(crate) fn translate(
        &mut self,
        from: ContextId,
        to: ContextId,
        msg: &Msgbuf,
        capacity: usize,
    ) -> Msgbuf {
        // Nothing larger than one message window crosses the kernel.
        let mut out = Msgbuf::with_capacity(capacity.min(self.config.message_words));
        let (Some(sender), Some(receiver)) = (self.threads.get(from), self.threads.get(to)) else {
            return out;
        };
        let (sender_identity, sender_pd, receiver_pd) = (sender.identity, sender.pd, receiver.pd);
        let resolved: Vec<Option<ObjectIdentity>> = match self.pd(sender_pd) {
            Ok(domain) => msg
                .caps()
                .iter()
                .map(|cap| domain.caps.lookup(cap.local_name()).ok())
                .collect(),
            Err(_) => vec![None; msg.caps().len()],
        };
        let Ok(domain) = self.pd_mut(receiver_pd) else {
            return out;
        };
        let mut resolved = resolved.into_iter();
        let delivery = msg.deliver_to(&mut out, |cap| match resolved.next().flatten() {
            Some(identity) => domain
                .caps
                .import(sender_identity, cap.local_name(), identity),
            None => CapRef::invalid(),
        });
        if delivery.truncated {
            trace!(%from, %to, words = delivery.words, "message truncated");
        }
        out
    }
}
