//! The in-process hub as a contract fixture

use crate::Substrate;
use core_types::{CapRef, ObjectIdentity};
use ipc::{LocalHub, LocalPort, Rendezvous};
use std::sync::Arc;
use tracing::trace;

pub struct LocalSubstrate {
    hub: Arc<LocalHub>,
}

impl Substrate for LocalSubstrate {
    type Port = LocalPort;

    fn new() -> Self {
        Self {
            hub: LocalHub::new(),
        }
    }

    fn port(&mut self, name: &str) -> LocalPort {
        let port = self.hub.port();
        trace!(name, identity = %port.identity(), "local fixture port");
        port
    }

    fn grant(&self, holder: &LocalPort, target: ObjectIdentity) -> CapRef {
        self.hub
            .grant(holder.identity(), target)
            .expect("holder is attached to the hub")
    }

    fn queued(&self, server: &LocalPort) -> usize {
        self.hub.queued(server.identity())
    }

    fn kill(&mut self, port: LocalPort) {
        drop(port);
    }
}
