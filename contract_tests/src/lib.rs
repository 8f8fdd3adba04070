//! # Rendezvous Contract Tests
//!
//! This crate holds one behavioural suite for the [`ipc::Rendezvous`]
//! contract and runs it against every substrate, so that the transports
//! cannot drift apart.
//!
//! ## Philosophy
//!
//! - **One contract**: a behaviour is checked once and holds everywhere
//! - **Substrates are fixtures**: each transport only says how to create,
//!   connect and kill endpoints
//! - **Observable outcomes only**: checks go through the trait, never
//!   through transport internals
//!
//! ## Structure
//!
//! - [`suite`]: the generic checks
//! - [`local`]: the in-process hub as a fixture
//! - [`kernel`]: the simulated kernel as a fixture

pub mod kernel;
pub mod local;
pub mod suite;

use core_types::{CapRef, ObjectIdentity};
use ipc::Rendezvous;

/// How the suite drives one transport
pub trait Substrate: Sized {
    type Port: Rendezvous + Send + 'static;

    fn new() -> Self;

    /// Creates a live endpoint in a capability space of its own
    fn port(&mut self, name: &str) -> Self::Port;

    /// Gives `holder` a capability designating `target`
    fn grant(&self, holder: &Self::Port, target: ObjectIdentity) -> CapRef;

    /// Requests queued at `server` and not yet received
    fn queued(&self, server: &Self::Port) -> usize;

    /// Ends the endpoint for good
    fn kill(&mut self, port: Self::Port);
}

/// Instantiates every check of [`suite`] as a test for one substrate
#[macro_export]
macro_rules! contract_suite {
    ($substrate:ty) => {
        #[test]
        fn test_round_trip() {
            $crate::suite::round_trip::<$substrate>();
        }

        #[test]
        fn test_requests_served_in_arrival_order() {
            $crate::suite::requests_served_in_arrival_order::<$substrate>();
        }

        #[test]
        fn test_messages_truncated_to_receiver() {
            $crate::suite::messages_truncated_to_receiver::<$substrate>();
        }

        #[test]
        fn test_invalid_destination() {
            $crate::suite::invalid_destination::<$substrate>();
        }

        #[test]
        fn test_call_to_self_rejected() {
            $crate::suite::call_to_self_rejected::<$substrate>();
        }

        #[test]
        fn test_call_to_dead_server() {
            $crate::suite::call_to_dead_server::<$substrate>();
        }

        #[test]
        fn test_server_death_cancels_queued_caller() {
            $crate::suite::server_death_cancels_queued_caller::<$substrate>();
        }

        #[test]
        fn test_server_death_cancels_delivered_caller() {
            $crate::suite::server_death_cancels_delivered_caller::<$substrate>();
        }

        #[test]
        fn test_reply_to_departed_caller_dropped() {
            $crate::suite::reply_to_departed_caller_dropped::<$substrate>();
        }

        #[test]
        fn test_reply_without_partner_is_noop() {
            $crate::suite::reply_without_partner_is_noop::<$substrate>();
        }

        #[test]
        fn test_cancel_wait() {
            $crate::suite::cancel_wait::<$substrate>();
        }

        #[test]
        fn test_capability_transfer() {
            $crate::suite::capability_transfer::<$substrate>();
        }
    };
}
