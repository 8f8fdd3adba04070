//! The simulated kernel as a contract fixture
//!
//! Every port is a started context in a protection domain of its own. All
//! contexts share CPU 0, so callers lend their shares to the servers they
//! wait on while the suite runs.

use crate::Substrate;
use core_types::{CapRef, ObjectIdentity, Priority};
use ipc::Rendezvous;
use sim_kernel::test_utils::{spawn_started, test_kernel};
use sim_kernel::{KernelPort, SharedKernel};
use std::sync::Arc;
use tracing::trace;

pub struct KernelSubstrate {
    shared: Arc<SharedKernel>,
}

impl KernelSubstrate {
    pub fn shared(&self) -> &Arc<SharedKernel> {
        &self.shared
    }
}

impl Substrate for KernelSubstrate {
    type Port = KernelPort;

    fn new() -> Self {
        Self {
            shared: SharedKernel::new(test_kernel()),
        }
    }

    fn port(&mut self, name: &str) -> KernelPort {
        let ctx = self.shared.with(|kernel| {
            let pd = kernel.create_pd(name);
            spawn_started(kernel, pd, name, Priority::MIN, 0)
        });
        let port = self.shared.port(ctx).expect("context was just started");
        trace!(name, thread = %ctx, identity = %port.identity(), "kernel fixture port");
        port
    }

    fn grant(&self, holder: &KernelPort, target: ObjectIdentity) -> CapRef {
        holder.grant(target).expect("holder is alive")
    }

    fn queued(&self, server: &KernelPort) -> usize {
        let ctx = server.context();
        self.shared
            .with(|kernel| kernel.queued_requests(ctx))
            .unwrap_or(0)
    }

    fn kill(&mut self, port: KernelPort) {
        let ctx = port.context();
        self.shared
            .with(|kernel| kernel.kill_thread(ctx))
            .expect("context exists");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::wait_until;
    use ipc::Msgbuf;
    use kernel_api::ThreadState;
    use std::thread;

    crate::contract_suite!(super::KernelSubstrate);

    #[test]
    fn test_blocked_caller_lends_to_server() {
        let mut substrate = KernelSubstrate::new();
        let mut server = substrate.port("server");
        let mut client = substrate.port("client");
        let (server_ctx, client_ctx) = (server.context(), client.context());
        let dest = substrate.grant(&client, server.identity());

        let call = thread::spawn(move || {
            let mut request = Msgbuf::with_capacity(1);
            request.push(&1u64).unwrap();
            let mut reply = Msgbuf::with_capacity(1);
            client.client_call(&dest, &request, &mut reply)
        });
        wait_until("the request is queued", || substrate.queued(&server) == 1);
        substrate.shared().with(|kernel| {
            assert_eq!(kernel.thread_state(client_ctx).unwrap(), ThreadState::AwaitsIpc);
            assert_eq!(kernel.helping_sink(client_ctx), server_ctx);
        });

        let mut request = Msgbuf::with_capacity(1);
        server.server_wait(&mut request).unwrap();
        server.server_reply(&Msgbuf::with_capacity(0));
        call.join().unwrap().unwrap();

        substrate.shared().with(|kernel| {
            assert_eq!(kernel.thread_state(client_ctx).unwrap(), ThreadState::Active);
            assert_eq!(kernel.helping_sink(client_ctx), client_ctx);
        });
    }
}
