//! The rendezvous contract
//!
//! Every message transport implements [`Rendezvous`]. Callers and servers
//! program against the trait only, so the same service code runs over the
//! in-process hub and over the simulated kernel.
//!
//! ## Contract
//!
//! - A call blocks the caller until the reply arrives or the exchange is
//!   cancelled. There is no asynchronous send.
//! - A server receives one request at a time, in arrival order. The caller
//!   that sent the delivered request is the server's partner until the
//!   server replies or waits again.
//! - A reply whose caller no longer waits is dropped silently.
//! - If the partner of a blocked operation dies, the operation completes
//!   with [`CancelReason::PartnerGone`](crate::CancelReason::PartnerGone).
//! - Messages are truncated to the receiver's buffer capacity.

use crate::error::IpcError;
use crate::msgbuf::Msgbuf;
use core_types::{CapRef, ObjectIdentity};
use serde::{Deserialize, Serialize};

/// Lifecycle of one request/reply exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeState {
    /// Queued at the server, not yet received
    Pending,
    /// Received by the server, reply outstanding
    Delivered,
    /// Reply handed to the caller
    Replied,
    /// Abandoned before a reply arrived
    Cancelled,
}

/// Aborts whatever blocking operation the owning endpoint is in
pub trait Cancel {
    /// Returns `true` if a blocked operation was cancelled
    ///
    /// Calling it while the endpoint is not blocked has no effect.
    fn cancel(&self) -> bool;
}

/// Synchronous request/reply endpoint
pub trait Rendezvous {
    type Canceller: Cancel + Send + Sync + 'static;

    /// Identity other endpoints see as the caller of requests from here
    fn identity(&self) -> ObjectIdentity;

    /// Returns a handle that can cancel this endpoint's blocking operations
    /// from another thread
    fn canceller(&self) -> Self::Canceller;

    /// Sends `request` to `dest` and blocks until the reply is in `reply`
    ///
    /// `dest` is resolved through the local name in the caller's capability
    /// space. Capabilities in `request` are transferred to the receiver.
    fn client_call(
        &mut self,
        dest: &CapRef,
        request: &Msgbuf,
        reply: &mut Msgbuf,
    ) -> Result<(), IpcError>;

    /// Blocks until a request arrives, returning the caller's identity
    fn server_wait(&mut self, request: &mut Msgbuf) -> Result<ObjectIdentity, IpcError>;

    /// Replies to the current partner, if any, without blocking
    fn server_reply(&mut self, reply: &Msgbuf);

    /// Replies to the current partner and waits for the next request
    ///
    /// Transports without a combined operation fall back to a reply
    /// followed by a wait.
    fn server_reply_and_wait(
        &mut self,
        reply: &Msgbuf,
        request: &mut Msgbuf,
    ) -> Result<ObjectIdentity, IpcError> {
        self.server_reply(reply);
        self.server_wait(request)
    }
}
