//! In-process rendezvous substrate
//!
//! A [`LocalHub`] connects any number of [`LocalPort`]s living on ordinary
//! host threads. All endpoint state sits behind one mutex; blocked callers
//! and servers sleep on a shared condition variable and re-check their own
//! endpoint when woken.
//!
//! Dropping a port is the death of that endpoint: its state leaves the hub
//! and every exchange it took part in completes with
//! [`CancelReason::PartnerGone`]. Capabilities only ever name endpoints that
//! existed, so a capability whose endpoint is missing names a dead one.

use crate::error::{CancelReason, IpcError};
use crate::msgbuf::Msgbuf;
use crate::transport::{Cancel, ExchangeState, Rendezvous};
use core_types::{CapRef, CapSpace, ObjectIdentity};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A request queued at a server
#[derive(Debug)]
struct QueuedCall {
    client: ObjectIdentity,
    seq: u64,
    message: Msgbuf,
}

/// The client side of an exchange in flight
#[derive(Debug)]
struct OutstandingCall {
    server: ObjectIdentity,
    seq: u64,
    reply_capacity: usize,
    state: ExchangeState,
    reply: Option<Msgbuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocked {
    No,
    InCall,
    InWait,
}

#[derive(Debug)]
struct Endpoint {
    caps: CapSpace,
    blocked: Blocked,
    abort: Option<CancelReason>,
    call: Option<OutstandingCall>,
    queue: VecDeque<QueuedCall>,
    partner: Option<(ObjectIdentity, u64)>,
    next_seq: u64,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            caps: CapSpace::new(),
            blocked: Blocked::No,
            abort: None,
            call: None,
            queue: VecDeque::new(),
            partner: None,
            next_seq: 0,
        }
    }

    fn awaits_reply_from(&self, server: ObjectIdentity, seq: u64) -> bool {
        matches!(
            &self.call,
            Some(call) if call.server == server
                && call.seq == seq
                && matches!(call.state, ExchangeState::Pending | ExchangeState::Delivered)
        )
    }

    /// Abandons the outstanding call and wakes the client
    fn cancel_call(&mut self, reason: CancelReason) {
        if let Some(call) = self.call.as_mut() {
            call.state = ExchangeState::Cancelled;
        }
        self.abort = Some(reason);
        self.blocked = Blocked::No;
    }
}

#[derive(Debug, Default)]
struct HubState {
    endpoints: HashMap<ObjectIdentity, Endpoint>,
}

impl HubState {
    /// Copies `msg` from `from` into a buffer of `capacity` words owned by
    /// `to`, importing its capabilities into `to`'s space
    fn translate(
        &mut self,
        from: ObjectIdentity,
        to: ObjectIdentity,
        msg: &Msgbuf,
        capacity: usize,
    ) -> Msgbuf {
        let resolved: Vec<Option<ObjectIdentity>> = match self.endpoints.get(&from) {
            Some(sender) => msg
                .caps()
                .iter()
                .map(|cap| sender.caps.lookup(cap.local_name()).ok())
                .collect(),
            None => vec![None; msg.caps().len()],
        };
        let mut out = Msgbuf::with_capacity(capacity);
        let Some(receiver) = self.endpoints.get_mut(&to) else {
            return out;
        };
        let mut resolved = resolved.into_iter();
        let delivery = msg.deliver_to(&mut out, |cap| match resolved.next().flatten() {
            Some(identity) => receiver.caps.import(from, cap.local_name(), identity),
            None => CapRef::invalid(),
        });
        if delivery.truncated {
            trace!(%from, %to, words = delivery.words, "message truncated on delivery");
        }
        out
    }

    /// Pops the next request whose client still waits for it
    fn next_request(&mut self, server: ObjectIdentity) -> Option<QueuedCall> {
        loop {
            let call = self.endpoints.get_mut(&server)?.queue.pop_front()?;
            if let Some(client) = self.endpoints.get_mut(&call.client) {
                if client.awaits_reply_from(server, call.seq) {
                    if let Some(outstanding) = client.call.as_mut() {
                        outstanding.state = ExchangeState::Delivered;
                    }
                    return Some(call);
                }
            }
            trace!(%server, client = %call.client, "skipping abandoned request");
        }
    }

    fn reply(&mut self, server: ObjectIdentity, reply: &Msgbuf) {
        let Some((client, seq)) = self
            .endpoints
            .get_mut(&server)
            .and_then(|endpoint| endpoint.partner.take())
        else {
            trace!(%server, "reply without partner");
            return;
        };
        let capacity = match self.endpoints.get(&client) {
            Some(endpoint) if endpoint.awaits_reply_from(server, seq) => endpoint
                .call
                .as_ref()
                .map(|call| call.reply_capacity)
                .unwrap_or(0),
            _ => {
                warn!(%server, %client, "dropping reply to departed caller");
                return;
            }
        };
        let message = self.translate(server, client, reply, capacity);
        if let Some(endpoint) = self.endpoints.get_mut(&client) {
            if let Some(call) = endpoint.call.as_mut() {
                call.state = ExchangeState::Replied;
                call.reply = Some(message);
            }
            endpoint.blocked = Blocked::No;
        }
    }

    fn deliver(
        &mut self,
        server: ObjectIdentity,
        call: QueuedCall,
        request: &mut Msgbuf,
    ) -> ObjectIdentity {
        call.message.deliver_to(request, |cap| *cap);
        if let Some(endpoint) = self.endpoints.get_mut(&server) {
            endpoint.partner = Some((call.client, call.seq));
        }
        call.client
    }
}

/// Connects in-process endpoints
#[derive(Debug, Default)]
pub struct LocalHub {
    state: Mutex<HubState>,
    changed: Condvar,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a new endpoint attached to this hub
    pub fn port(self: &Arc<Self>) -> LocalPort {
        let identity = ObjectIdentity::new();
        self.state.lock().endpoints.insert(identity, Endpoint::new());
        debug!(%identity, "local port created");
        LocalPort {
            hub: Arc::clone(self),
            identity,
        }
    }

    /// Gives `holder` a capability designating `target`
    ///
    /// Both endpoints must be live.
    pub fn grant(
        &self,
        holder: ObjectIdentity,
        target: ObjectIdentity,
    ) -> Result<CapRef, IpcError> {
        let mut state = self.state.lock();
        if !state.endpoints.contains_key(&target) {
            return Err(IpcError::InvalidDestination);
        }
        let endpoint = state
            .endpoints
            .get_mut(&holder)
            .ok_or(IpcError::InvalidDestination)?;
        Ok(endpoint.caps.insert(target))
    }

    /// Number of requests queued at `server`
    pub fn queued(&self, server: ObjectIdentity) -> usize {
        self.state
            .lock()
            .endpoints
            .get(&server)
            .map(|endpoint| endpoint.queue.len())
            .unwrap_or(0)
    }

    /// Number of live endpoints
    pub fn endpoints(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

/// An endpoint on a [`LocalHub`]
#[derive(Debug)]
pub struct LocalPort {
    hub: Arc<LocalHub>,
    identity: ObjectIdentity,
}

impl LocalPort {
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    fn wait_for_request(
        &self,
        state: &mut parking_lot::MutexGuard<'_, HubState>,
        request: &mut Msgbuf,
    ) -> Result<ObjectIdentity, IpcError> {
        let me = self.identity;
        if let Some(endpoint) = state.endpoints.get_mut(&me) {
            endpoint.partner = None;
            endpoint.blocked = Blocked::InWait;
        }
        loop {
            let endpoint = state
                .endpoints
                .get_mut(&me)
                .ok_or(IpcError::InvalidDestination)?;
            if let Some(reason) = endpoint.abort.take() {
                endpoint.blocked = Blocked::No;
                return Err(IpcError::Cancelled(reason));
            }
            if let Some(call) = state.next_request(me) {
                if let Some(endpoint) = state.endpoints.get_mut(&me) {
                    endpoint.blocked = Blocked::No;
                }
                let caller = state.deliver(me, call, request);
                trace!(server = %me, %caller, "request delivered");
                return Ok(caller);
            }
            self.hub.changed.wait(state);
        }
    }
}

impl Rendezvous for LocalPort {
    type Canceller = LocalCanceller;

    fn identity(&self) -> ObjectIdentity {
        self.identity
    }

    fn canceller(&self) -> LocalCanceller {
        LocalCanceller {
            hub: Arc::clone(&self.hub),
            identity: self.identity,
        }
    }

    fn client_call(
        &mut self,
        dest: &CapRef,
        request: &Msgbuf,
        reply: &mut Msgbuf,
    ) -> Result<(), IpcError> {
        let me = self.identity;
        let mut state = self.hub.state.lock();

        let server = state
            .endpoints
            .get(&me)
            .and_then(|endpoint| endpoint.caps.lookup(dest.local_name()).ok())
            .ok_or(IpcError::InvalidDestination)?;
        if server == me {
            return Err(IpcError::InvalidState("call to own endpoint".into()));
        }
        if !state.endpoints.contains_key(&server) {
            return Err(IpcError::Cancelled(CancelReason::PartnerGone));
        }

        let message = state.translate(me, server, request, request.len());
        let seq = {
            let endpoint = state
                .endpoints
                .get_mut(&me)
                .ok_or(IpcError::InvalidDestination)?;
            let seq = endpoint.next_seq;
            endpoint.next_seq += 1;
            endpoint.abort = None;
            endpoint.blocked = Blocked::InCall;
            endpoint.call = Some(OutstandingCall {
                server,
                seq,
                reply_capacity: reply.capacity(),
                state: ExchangeState::Pending,
                reply: None,
            });
            seq
        };
        if let Some(endpoint) = state.endpoints.get_mut(&server) {
            endpoint.queue.push_back(QueuedCall {
                client: me,
                seq,
                message,
            });
        }
        trace!(client = %me, %server, seq, "request queued");
        self.hub.changed.notify_all();

        loop {
            let endpoint = state
                .endpoints
                .get_mut(&me)
                .ok_or(IpcError::InvalidDestination)?;
            if let Some(reason) = endpoint.abort.take() {
                endpoint.call = None;
                endpoint.blocked = Blocked::No;
                return Err(IpcError::Cancelled(reason));
            }
            if let Some(call) = endpoint.call.as_mut() {
                if call.state == ExchangeState::Replied {
                    if let Some(message) = call.reply.take() {
                        *reply = message;
                    }
                    endpoint.call = None;
                    return Ok(());
                }
            }
            self.hub.changed.wait(&mut state);
        }
    }

    fn server_wait(&mut self, request: &mut Msgbuf) -> Result<ObjectIdentity, IpcError> {
        let mut state = self.hub.state.lock();
        self.wait_for_request(&mut state, request)
    }

    fn server_reply(&mut self, reply: &Msgbuf) {
        let mut state = self.hub.state.lock();
        state.reply(self.identity, reply);
        self.hub.changed.notify_all();
    }

    fn server_reply_and_wait(
        &mut self,
        reply: &Msgbuf,
        request: &mut Msgbuf,
    ) -> Result<ObjectIdentity, IpcError> {
        let mut state = self.hub.state.lock();
        state.reply(self.identity, reply);
        self.hub.changed.notify_all();
        self.wait_for_request(&mut state, request)
    }
}

impl Drop for LocalPort {
    fn drop(&mut self) {
        let me = self.identity;
        let mut state = self.hub.state.lock();
        state.endpoints.remove(&me);
        let mut orphaned = 0usize;
        for endpoint in state.endpoints.values_mut() {
            let waits_on_me = matches!(
                &endpoint.call,
                Some(call) if call.server == me
                    && matches!(call.state, ExchangeState::Pending | ExchangeState::Delivered)
            );
            if waits_on_me {
                endpoint.cancel_call(CancelReason::PartnerGone);
                orphaned += 1;
            }
        }
        debug!(identity = %me, orphaned, "local port closed");
        self.hub.changed.notify_all();
    }
}

/// Cancels blocking operations of one [`LocalPort`]
#[derive(Debug, Clone)]
pub struct LocalCanceller {
    hub: Arc<LocalHub>,
    identity: ObjectIdentity,
}

impl Cancel for LocalCanceller {
    fn cancel(&self) -> bool {
        let me = self.identity;
        let mut state = self.hub.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&me) else {
            return false;
        };
        let target = match endpoint.blocked {
            Blocked::No => return false,
            Blocked::InWait => {
                endpoint.abort = Some(CancelReason::Aborted);
                endpoint.blocked = Blocked::No;
                None
            }
            Blocked::InCall => {
                let target = endpoint.call.as_ref().map(|call| (call.server, call.seq));
                endpoint.cancel_call(CancelReason::Aborted);
                target
            }
        };
        if let Some((server, seq)) = target {
            if let Some(server) = state.endpoints.get_mut(&server) {
                server.queue.retain(|call| !(call.client == me && call.seq == seq));
                if server.partner == Some((me, seq)) {
                    server.partner = None;
                }
            }
        }
        debug!(identity = %me, "blocked operation cancelled");
        self.hub.changed.notify_all();
        true
    }
}
