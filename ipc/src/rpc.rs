//! Opcode dispatch on top of the rendezvous contract
//!
//! A request starts with an [`Opcode`] word followed by the arguments. A
//! reply starts with an [`ExceptionCode`] word; results follow only when the
//! code is [`ExceptionCode::Success`].

use crate::error::{IpcError, MarshalError};
use crate::msgbuf::{Msgbuf, Unmarshaller, Word};
use crate::transport::Rendezvous;
use core_types::{CapRef, ObjectIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{trace, warn};

/// Selects the operation of an RPC interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Opcode(pub u64);

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Outcome code carried in the first reply word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionCode {
    Success,
    /// The object has no operation for the opcode
    InvalidOpcode,
    /// The addressed object does not exist at the server
    InvalidObject,
    /// Interface-defined failure
    ///
    /// Codes from -2 to 0 share their words with the variants above and are
    /// never sent; build custom codes with [`ExceptionCode::custom`].
    Custom(i64),
}

impl ExceptionCode {
    /// A custom code, unless `code` collides with a predefined one
    pub fn custom(code: i64) -> Option<Self> {
        (!Self::is_reserved(code)).then_some(ExceptionCode::Custom(code))
    }

    /// Whether `code` is the word of a predefined variant
    pub fn is_reserved(code: i64) -> bool {
        (-2..=0).contains(&code)
    }

    pub fn to_word(self) -> Word {
        let raw: i64 = match self {
            ExceptionCode::Success => 0,
            ExceptionCode::InvalidOpcode => -1,
            ExceptionCode::InvalidObject => -2,
            ExceptionCode::Custom(code) => code,
        };
        raw as Word
    }

    pub fn from_word(word: Word) -> Self {
        match word as i64 {
            0 => ExceptionCode::Success,
            -1 => ExceptionCode::InvalidOpcode,
            -2 => ExceptionCode::InvalidObject,
            code => ExceptionCode::Custom(code),
        }
    }
}

/// RPC-level errors seen by a client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("Server raised {0:?}")]
    Exception(ExceptionCode),
}

/// A decoded request handed to [`RpcObject::dispatch`]
#[derive(Debug)]
pub struct RpcRequest<'a> {
    pub opcode: Opcode,
    pub caller: ObjectIdentity,
    pub args: Unmarshaller<'a>,
}

/// Server-side implementation of an RPC interface
pub trait RpcObject {
    /// Executes one request, appending results to `results`
    ///
    /// Anything appended is discarded unless the returned code is
    /// [`ExceptionCode::Success`].
    fn dispatch(&mut self, request: &mut RpcRequest<'_>, results: &mut Msgbuf) -> ExceptionCode;
}

/// Serves one [`RpcObject`] on one endpoint
pub struct Entrypoint<R: Rendezvous, O: RpcObject> {
    port: R,
    object: O,
    request: Msgbuf,
    reply: Msgbuf,
}

impl<R: Rendezvous, O: RpcObject> Entrypoint<R, O> {
    /// Creates an entrypoint whose buffers hold `capacity` words
    pub fn new(port: R, object: O, capacity: usize) -> Self {
        Self {
            port,
            object,
            request: Msgbuf::with_capacity(capacity),
            reply: Msgbuf::with_capacity(capacity.max(1)),
        }
    }

    pub fn port(&self) -> &R {
        &self.port
    }

    pub fn object(&self) -> &O {
        &self.object
    }

    pub fn into_parts(self) -> (R, O) {
        (self.port, self.object)
    }

    fn handle(&mut self, caller: ObjectIdentity) {
        self.reply.clear();
        let mut args = self.request.unmarshaller();
        let code = match args.next::<u64>() {
            Ok(opcode) => match self.reply.push_word(0) {
                Ok(()) => {
                    let mut request = RpcRequest {
                        opcode: Opcode(opcode),
                        caller,
                        args,
                    };
                    self.object.dispatch(&mut request, &mut self.reply)
                }
                Err(_) => ExceptionCode::InvalidOpcode,
            },
            Err(_) => ExceptionCode::InvalidOpcode,
        };
        let code = match code {
            ExceptionCode::Custom(raw) if ExceptionCode::is_reserved(raw) => {
                warn!(%caller, raw, "object raised a reserved exception code");
                ExceptionCode::InvalidOpcode
            }
            code => code,
        };
        trace!(%caller, ?code, "request dispatched");
        if code == ExceptionCode::Success {
            // Header word was reserved above.
            let _ = self.reply.set_word(0, code.to_word());
        } else {
            self.reply.clear();
            let _ = self.reply.push_word(code.to_word());
        }
    }

    /// Serves requests until `limit` have been answered or the wait is
    /// cancelled
    ///
    /// Returns the number of requests served.
    pub fn serve(&mut self, limit: Option<u64>) -> Result<u64, IpcError> {
        let mut served = 0u64;
        let mut caller = self.port.server_wait(&mut self.request)?;
        loop {
            self.handle(caller);
            served += 1;
            if limit.is_some_and(|limit| served >= limit) {
                self.port.server_reply(&self.reply);
                return Ok(served);
            }
            caller = match self
                .port
                .server_reply_and_wait(&self.reply, &mut self.request)
            {
                Ok(caller) => caller,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    warn!(%err, "reply-and-wait failed, falling back to wait");
                    self.port.server_wait(&mut self.request)?
                }
            };
        }
    }
}

/// Client side of an RPC interface
pub struct RpcClient<R: Rendezvous> {
    port: R,
    request: Msgbuf,
    reply: Msgbuf,
}

impl<R: Rendezvous> RpcClient<R> {
    pub fn new(port: R, capacity: usize) -> Self {
        Self {
            port,
            request: Msgbuf::with_capacity(capacity),
            reply: Msgbuf::with_capacity(capacity),
        }
    }

    pub fn port(&self) -> &R {
        &self.port
    }

    pub fn into_port(self) -> R {
        self.port
    }

    /// Calls `opcode` on `dest`, marshalling arguments with `args`
    ///
    /// On success the returned reader is positioned at the first result.
    pub fn invoke<F>(
        &mut self,
        dest: &CapRef,
        opcode: Opcode,
        args: F,
    ) -> Result<Unmarshaller<'_>, RpcError>
    where
        F: FnOnce(&mut Msgbuf) -> Result<(), MarshalError>,
    {
        self.request.clear();
        self.request.push(&opcode.0)?;
        args(&mut self.request)?;
        self.port.client_call(dest, &self.request, &mut self.reply)?;

        let mut results = self.reply.unmarshaller();
        match ExceptionCode::from_word(results.next_word()?) {
            ExceptionCode::Success => Ok(results),
            code => Err(RpcError::Exception(code)),
        }
    }
}
