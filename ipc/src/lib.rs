//! # Inter-Process Communication (IPC)
//!
//! This crate defines the synchronous, capability-addressed message
//! rendezvous shared by every transport.
//!
//! ## Philosophy
//!
//! - **Rendezvous, not mailboxes**: a call blocks until its reply arrives
//! - **Capabilities, not addresses**: destinations are named through the
//!   caller's own capability space
//! - **One contract, many substrates**: service code is written against
//!   [`Rendezvous`] and runs unchanged over each transport
//!
//! ## Architecture
//!
//! - [`msgbuf`]: fixed-capacity word buffers with sequential marshalling
//! - [`transport`]: the [`Rendezvous`] trait and cancellation handles
//! - [`local`]: an in-process substrate for host threads
//! - [`rpc`]: opcode dispatch and exception codes on top of the contract

pub mod error;
pub mod local;
pub mod msgbuf;
pub mod rpc;
pub mod transport;

pub use error::{CancelReason, IpcError, MarshalError};
pub use local::{LocalCanceller, LocalHub, LocalPort};
pub use msgbuf::{
    Delivery, Marshal, Msgbuf, Unmarshal, Unmarshaller, Word, INVALID_CAP_MARKER,
    MAX_CAPS_PER_MSG, WORD_BYTES,
};
pub use rpc::{Entrypoint, ExceptionCode, Opcode, RpcClient, RpcError, RpcObject, RpcRequest};
pub use transport::{Cancel, ExchangeState, Rendezvous};
