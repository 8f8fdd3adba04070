//! Rendezvous and priority donation on a single CPU

use core_types::{CpuId, Priority};
use ipc::{CancelReason, IpcError, Msgbuf};
use kernel_api::{KernelError, ThreadState};
use sim_kernel::test_utils::{spawn_started, spawn_started_on, test_kernel};
use sim_kernel::{CallOutcome, Completion, SimulatedKernel};

fn message(words: &[u64]) -> Msgbuf {
    let mut msg = Msgbuf::with_capacity(words.len());
    for word in words {
        msg.push_word(*word).unwrap();
    }
    msg
}

fn expect_request(completion: Option<Completion>) -> Msgbuf {
    match completion {
        Some(Completion::Request { message, .. }) => message,
        other => panic!("expected a request, got {other:?}"),
    }
}

struct Pair {
    kernel: SimulatedKernel,
    client: core_types::ContextId,
    server: core_types::ContextId,
    dest: core_types::LocalName,
}

/// A client of priority 3 with quota and a server of priority 1 without
fn pair() -> Pair {
    let mut kernel = test_kernel();
    let pd = kernel.create_pd("app");
    let client = spawn_started(&mut kernel, pd, "client", Priority::new(3), 200);
    let server = spawn_started(&mut kernel, pd, "server", Priority::new(1), 0);
    let identity = kernel.thread_identity(server).unwrap();
    let dest = kernel.grant(pd, identity).unwrap().local_name();
    Pair {
        kernel,
        client,
        server,
        dest,
    }
}

#[test]
fn test_call_reply_round_trip() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();

    assert_eq!(kernel.await_request(server, 4).unwrap(), CallOutcome::Blocked);
    assert_eq!(kernel.thread_state(server).unwrap(), ThreadState::AwaitsIpc);

    let outcome = kernel.send_request(client, dest, &message(&[7, 8]), 4).unwrap();
    assert_eq!(outcome, CallOutcome::Blocked);
    assert_eq!(kernel.thread_state(server).unwrap(), ThreadState::Active);
    assert_eq!(kernel.thread_state(client).unwrap(), ThreadState::AwaitsIpc);

    let request = expect_request(kernel.take_completion(server));
    assert_eq!(request.words(), &[7, 8]);

    kernel.send_reply(server, &message(&[15])).unwrap();
    assert_eq!(kernel.thread_state(client).unwrap(), ThreadState::Active);
    match kernel.take_completion(client) {
        Some(Completion::Reply(reply)) => assert_eq!(reply.words(), &[15]),
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[test]
fn test_requests_queue_in_arrival_order() {
    let mut kernel = test_kernel();
    let pd = kernel.create_pd("app");
    let server = spawn_started(&mut kernel, pd, "server", Priority::MIN, 0);
    let first = spawn_started(&mut kernel, pd, "first", Priority::MIN, 0);
    let second = spawn_started(&mut kernel, pd, "second", Priority::MIN, 0);
    let identity = kernel.thread_identity(server).unwrap();
    let dest = kernel.grant(pd, identity).unwrap().local_name();

    kernel.send_request(first, dest, &message(&[1]), 1).unwrap();
    kernel.send_request(second, dest, &message(&[2]), 1).unwrap();

    let CallOutcome::Done(Completion::Request { caller, message: request }) =
        kernel.await_request(server, 1).unwrap()
    else {
        panic!("queued request not taken");
    };
    assert_eq!(caller, kernel.thread_identity(first).unwrap());
    assert_eq!(request.words(), &[1]);

    let CallOutcome::Done(Completion::Request { caller, .. }) =
        kernel.reply_and_wait(server, &Msgbuf::with_capacity(0), 1).unwrap()
    else {
        panic!("second request not taken");
    };
    assert_eq!(caller, kernel.thread_identity(second).unwrap());
    assert_eq!(kernel.thread_state(first).unwrap(), ThreadState::Active);
    assert_eq!(kernel.thread_state(second).unwrap(), ThreadState::AwaitsIpc);
}

#[test]
fn test_request_truncated_to_server_buffer() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();
    kernel.await_request(server, 2).unwrap();
    kernel
        .send_request(client, dest, &message(&[1, 2, 3, 4]), 1)
        .unwrap();
    let request = expect_request(kernel.take_completion(server));
    assert_eq!(request.words(), &[1, 2]);

    kernel.send_reply(server, &message(&[9, 9, 9])).unwrap();
    match kernel.take_completion(client) {
        Some(Completion::Reply(reply)) => assert_eq!(reply.words(), &[9]),
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[test]
fn test_unknown_destination() {
    let Pair {
        mut kernel, client, ..
    } = pair();
    let err = kernel
        .send_request(client, core_types::LocalName(999), &message(&[]), 0)
        .unwrap_err();
    assert_eq!(err, KernelError::Ipc(IpcError::InvalidDestination));
    assert_eq!(kernel.thread_state(client).unwrap(), ThreadState::Active);
}

#[test]
fn test_call_to_dead_server() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();
    kernel.kill_thread(server).unwrap();
    assert_eq!(
        kernel.send_request(client, dest, &message(&[1]), 1).unwrap(),
        CallOutcome::Done(Completion::Cancelled(CancelReason::PartnerGone))
    );
    assert_eq!(kernel.thread_state(client).unwrap(), ThreadState::Active);
}

#[test]
fn test_server_death_cancels_waiting_clients() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();
    kernel.send_request(client, dest, &message(&[1]), 1).unwrap();
    kernel.kill_thread(server).unwrap();

    assert_eq!(kernel.thread_state(client).unwrap(), ThreadState::Active);
    assert_eq!(
        kernel.take_completion(client),
        Some(Completion::Cancelled(CancelReason::PartnerGone))
    );
    let (cpu, share) = kernel.thread_share(client).unwrap();
    assert!(kernel.scheduler(cpu).unwrap().is_ready(share));
}

#[test]
fn test_reply_to_departed_client_is_dropped() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();
    kernel.await_request(server, 1).unwrap();
    kernel.send_request(client, dest, &message(&[1]), 1).unwrap();
    kernel.take_completion(server);
    assert!(kernel.resume_thread(client).unwrap());
    assert_eq!(
        kernel.take_completion(client),
        Some(Completion::Cancelled(CancelReason::Aborted))
    );

    kernel.send_reply(server, &message(&[2])).unwrap();
    assert_eq!(kernel.take_completion(client), None);
    assert_eq!(kernel.thread_state(server).unwrap(), ThreadState::Active);
}

#[test]
fn test_cancellation_is_idempotent() {
    let Pair {
        mut kernel,
        client,
        dest,
        ..
    } = pair();
    kernel.send_request(client, dest, &message(&[1]), 1).unwrap();
    assert!(kernel.resume_thread(client).unwrap());
    assert!(!kernel.resume_thread(client).unwrap());
    assert_eq!(
        kernel.take_completion(client),
        Some(Completion::Cancelled(CancelReason::Aborted))
    );
    assert_eq!(kernel.take_completion(client), None);
}

#[test]
fn test_capability_transfer() {
    let mut kernel = test_kernel();
    let client_pd = kernel.create_pd("client");
    let server_pd = kernel.create_pd("server");
    let client = spawn_started(&mut kernel, client_pd, "client", Priority::MIN, 0);
    let server = spawn_started(&mut kernel, server_pd, "server", Priority::MIN, 0);
    let server_identity = kernel.thread_identity(server).unwrap();
    let dest = kernel.grant(client_pd, server_identity).unwrap();

    let object = core_types::ObjectIdentity::new();
    let cap = kernel.grant(client_pd, object).unwrap();
    let mut request = Msgbuf::with_capacity(2);
    request.push(&cap).unwrap();
    request.push(&cap).unwrap();

    kernel.await_request(server, 2).unwrap();
    kernel
        .send_request(client, dest.local_name(), &request, 0)
        .unwrap();
    let request = expect_request(kernel.take_completion(server));
    let mut args = request.unmarshaller();
    let first: core_types::CapRef = args.next().unwrap();
    let second: core_types::CapRef = args.next().unwrap();
    assert_eq!(first, second);
    assert_eq!(kernel.lookup(server_pd, &first).unwrap(), object);
}

#[test]
fn test_scenario_b_donation_during_call() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();
    let cpu = CpuId(0);
    assert_eq!(
        kernel.effective_priority(server).unwrap(),
        Some(Priority::new(1))
    );

    kernel.send_request(client, dest, &message(&[1]), 1).unwrap();
    let lent = kernel.effective_priority(server).unwrap();
    assert!(lent >= Some(Priority::new(3)));
    assert_eq!(kernel.effective_priority(client).unwrap(), None);

    // The client's claim now runs the server.
    assert_eq!(kernel.run_once(cpu, 0).unwrap(), Some(server));
    let (_, client_share) = kernel.thread_share(client).unwrap();
    assert_eq!(kernel.scheduler(cpu).unwrap().head(), client_share);
    assert_eq!(kernel.helping_sink(client), server);

    let request = expect_request(kernel.await_request(server, 1).ok().and_then(|outcome| match outcome {
        CallOutcome::Done(completion) => Some(completion),
        CallOutcome::Blocked => None,
    }));
    assert_eq!(request.words(), &[1]);
    kernel.send_reply(server, &message(&[2])).unwrap();

    assert_eq!(
        kernel.effective_priority(server).unwrap(),
        Some(Priority::new(1))
    );
    assert_eq!(
        kernel.effective_priority(client).unwrap(),
        Some(Priority::new(3))
    );
    assert_eq!(kernel.run_once(cpu, 0).unwrap(), Some(client));
}

#[test]
fn test_blocked_server_takes_the_loan_along() {
    let Pair {
        mut kernel,
        client,
        server,
        dest,
    } = pair();
    let cpu = CpuId(0);
    kernel.send_request(client, dest, &message(&[1]), 1).unwrap();
    kernel.pause_thread(server).unwrap();

    let scheduler = kernel.scheduler(cpu).unwrap();
    let (_, client_share) = kernel.thread_share(client).unwrap();
    let (_, server_share) = kernel.thread_share(server).unwrap();
    assert!(!scheduler.is_ready(client_share));
    assert!(!scheduler.is_ready(server_share));
    assert_eq!(kernel.run_once(cpu, 0).unwrap(), None);

    assert!(kernel.resume_thread(server).unwrap());
    let scheduler = kernel.scheduler(cpu).unwrap();
    assert!(scheduler.is_ready(client_share));
    assert!(scheduler.is_ready(server_share));
    assert_eq!(kernel.run_once(cpu, 0).unwrap(), Some(server));
}

#[test]
fn test_no_loan_across_cpus() {
    let mut kernel = test_kernel();
    let pd = kernel.create_pd("app");
    let client = spawn_started(&mut kernel, pd, "client", Priority::new(3), 100);
    let server = spawn_started_on(&mut kernel, pd, "server", CpuId(1), Priority::new(1), 0);
    let identity = kernel.thread_identity(server).unwrap();
    let dest = kernel.grant(pd, identity).unwrap().local_name();

    kernel.send_request(client, dest, &message(&[1]), 1).unwrap();
    let (cpu, share) = kernel.thread_share(client).unwrap();
    assert!(!kernel.scheduler(cpu).unwrap().is_ready(share));
    assert_eq!(
        kernel.effective_priority(server).unwrap(),
        Some(Priority::new(1))
    );
    assert_eq!(kernel.run_once(CpuId(0), 0).unwrap(), None);
    assert_eq!(kernel.run_once(CpuId(1), 0).unwrap(), Some(server));
}

#[test]
fn test_call_chain_lends_through() {
    let mut kernel = test_kernel();
    let pd = kernel.create_pd("app");
    let client = spawn_started(&mut kernel, pd, "client", Priority::new(3), 100);
    let middle = spawn_started(&mut kernel, pd, "middle", Priority::new(2), 0);
    let backend = spawn_started(&mut kernel, pd, "backend", Priority::new(0), 0);
    let to_middle = kernel
        .grant(pd, kernel.thread_identity(middle).unwrap())
        .unwrap()
        .local_name();
    let to_backend = kernel
        .grant(pd, kernel.thread_identity(backend).unwrap())
        .unwrap()
        .local_name();

    kernel.send_request(client, to_middle, &message(&[1]), 1).unwrap();
    kernel.send_request(middle, to_backend, &message(&[2]), 1).unwrap();

    assert_eq!(kernel.helping_sink(client), backend);
    assert_eq!(
        kernel.effective_priority(backend).unwrap(),
        Some(Priority::new(3))
    );
    assert_eq!(kernel.run_once(CpuId(0), 0).unwrap(), Some(backend));
}

#[test]
fn test_message_window_bounds_delivery() {
    let config = kernel_api::KernelConfig {
        message_words: 2,
        ..sim_kernel::test_utils::test_config()
    };
    let mut kernel = SimulatedKernel::new(config).unwrap();
    let pd = kernel.create_pd("app");
    let client = spawn_started(&mut kernel, pd, "client", Priority::MIN, 0);
    let server = spawn_started(&mut kernel, pd, "server", Priority::MIN, 0);
    let identity = kernel.thread_identity(server).unwrap();
    let dest = kernel.grant(pd, identity).unwrap().local_name();

    kernel.await_request(server, 8).unwrap();
    kernel
        .send_request(client, dest, &message(&[1, 2, 3, 4]), 8)
        .unwrap();
    let request = expect_request(kernel.take_completion(server));
    assert_eq!(request.words(), &[1, 2]);
}

#[test]
fn test_call_into_busy_chain_keeps_the_loan() {
    let mut kernel = test_kernel();
    let pd = kernel.create_pd("app");
    let client = spawn_started(&mut kernel, pd, "client", Priority::new(3), 100);
    let middle = spawn_started(&mut kernel, pd, "middle", Priority::new(2), 0);
    let backend = spawn_started(&mut kernel, pd, "backend", Priority::new(0), 0);
    let to_middle = kernel
        .grant(pd, kernel.thread_identity(middle).unwrap())
        .unwrap()
        .local_name();
    let to_backend = kernel
        .grant(pd, kernel.thread_identity(backend).unwrap())
        .unwrap()
        .local_name();
    let cpu = CpuId(0);
    let (_, client_share) = kernel.thread_share(client).unwrap();

    kernel.send_request(middle, to_backend, &message(&[2]), 1).unwrap();
    kernel.send_request(client, to_middle, &message(&[1]), 1).unwrap();

    assert!(kernel.scheduler(cpu).unwrap().is_ready(client_share));
    assert_eq!(kernel.helping_sink(client), backend);
    assert_eq!(
        kernel.effective_priority(backend).unwrap(),
        Some(Priority::new(3))
    );

    let outcome = kernel.await_request(backend, 1).unwrap();
    let CallOutcome::Done(completion) = outcome else {
        panic!("middle's request was queued");
    };
    assert_eq!(expect_request(Some(completion)).words(), &[2]);
    kernel.send_reply(backend, &message(&[3])).unwrap();
    assert!(matches!(
        kernel.take_completion(middle),
        Some(Completion::Reply(_))
    ));

    let outcome = kernel.await_request(middle, 1).unwrap();
    let CallOutcome::Done(completion) = outcome else {
        panic!("client's request was queued");
    };
    assert_eq!(expect_request(Some(completion)).words(), &[1]);

    assert!(kernel.scheduler(cpu).unwrap().is_ready(client_share));
    assert_eq!(
        kernel.effective_priority(middle).unwrap(),
        Some(Priority::new(3))
    );
    assert_eq!(kernel.effective_priority(backend).unwrap(), Some(Priority::new(0)));

    kernel.send_reply(middle, &message(&[4])).unwrap();
    assert_eq!(
        kernel.effective_priority(middle).unwrap(),
        Some(Priority::new(2))
    );
}

#[test]
fn test_waking_server_restores_parked_loan() {
    let mut kernel = test_kernel();
    let pd = kernel.create_pd("app");
    let client = spawn_started(&mut kernel, pd, "client", Priority::new(3), 100);
    let middle = spawn_started(&mut kernel, pd, "middle", Priority::new(2), 0);
    let backend = spawn_started(&mut kernel, pd, "backend", Priority::new(0), 0);
    let to_middle = kernel
        .grant(pd, kernel.thread_identity(middle).unwrap())
        .unwrap()
        .local_name();
    let to_backend = kernel
        .grant(pd, kernel.thread_identity(backend).unwrap())
        .unwrap()
        .local_name();
    let cpu = CpuId(0);
    let (_, client_share) = kernel.thread_share(client).unwrap();

    // The backend is paused, so the chain ends in a context that cannot run.
    kernel.send_request(middle, to_backend, &message(&[2]), 1).unwrap();
    kernel.pause_thread(backend).unwrap();
    kernel.send_request(client, to_middle, &message(&[1]), 1).unwrap();
    assert!(!kernel.scheduler(cpu).unwrap().is_ready(client_share));

    kernel.resume_thread(backend).unwrap();
    assert!(kernel.scheduler(cpu).unwrap().is_ready(client_share));
    assert_eq!(
        kernel.effective_priority(backend).unwrap(),
        Some(Priority::new(3))
    );
}
