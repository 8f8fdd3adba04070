//! Behavioural checks every substrate must pass
//!
//! Each check builds its own endpoints, runs the exchange on host threads
//! and panics on the first deviation. Servers block on the calling thread
//! wherever the order of events allows it; only the side that has to wait
//! for the other runs on a spawned thread.

use crate::Substrate;
use core_types::CapRef;
use ipc::{Cancel, CancelReason, IpcError, Msgbuf, Rendezvous};
use std::thread;
use std::time::{Duration, Instant};

fn words(values: &[u64], capacity: usize) -> Msgbuf {
    let mut msg = Msgbuf::with_capacity(capacity);
    for value in values {
        msg.push(value).expect("message fits its buffer");
    }
    msg
}

pub(crate) fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Calls `dest` from a fresh thread and hands back the reply words and the
/// port
fn spawn_call<P: Rendezvous + Send + 'static>(
    mut port: P,
    dest: CapRef,
    values: &[u64],
    reply_capacity: usize,
) -> thread::JoinHandle<(Result<Vec<u64>, IpcError>, P)> {
    let request = words(values, values.len());
    thread::spawn(move || {
        let mut reply = Msgbuf::with_capacity(reply_capacity);
        let result = port
            .client_call(&dest, &request, &mut reply)
            .map(|()| reply.words().to_vec());
        (result, port)
    })
}

/// Serves one request on `server`, answering with `answer`
fn serve_one<P: Rendezvous>(server: &mut P, answer: &[u64]) -> Vec<u64> {
    let mut request = Msgbuf::with_capacity(8);
    server.server_wait(&mut request).expect("request arrives");
    server.server_reply(&words(answer, answer.len()));
    request.words().to_vec()
}

pub fn round_trip<S: Substrate>() {
    let mut substrate = S::new();
    let mut server = substrate.port("server");
    let mut client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());
    let client_identity = client.identity();

    let handle = thread::spawn(move || {
        let mut request = Msgbuf::with_capacity(4);
        let caller = server.server_wait(&mut request).expect("request arrives");
        let mut args = request.unmarshaller();
        let a: u64 = args.next().expect("first operand");
        let b: u64 = args.next().expect("second operand");
        server.server_reply(&words(&[a + b], 1));
        (caller, server)
    });

    let mut reply = Msgbuf::with_capacity(4);
    client
        .client_call(&dest, &words(&[40, 2], 2), &mut reply)
        .expect("call completes");
    assert_eq!(reply.words(), &[42]);

    let (caller, _server) = handle.join().expect("server thread");
    assert_eq!(caller, client_identity);
}

pub fn requests_served_in_arrival_order<S: Substrate>() {
    let mut substrate = S::new();
    let mut server = substrate.port("server");
    let first = substrate.port("first");
    let second = substrate.port("second");
    let (first_identity, second_identity) = (first.identity(), second.identity());
    let to_server_first = substrate.grant(&first, server.identity());
    let to_server_second = substrate.grant(&second, server.identity());

    let first_call = spawn_call(first, to_server_first, &[1], 1);
    wait_until("the first request is queued", || substrate.queued(&server) == 1);
    let second_call = spawn_call(second, to_server_second, &[2], 1);
    wait_until("the second request is queued", || substrate.queued(&server) == 2);

    let mut request = Msgbuf::with_capacity(1);
    let caller = server.server_wait(&mut request).expect("first request");
    assert_eq!(caller, first_identity);
    assert_eq!(request.words(), &[1]);

    let caller = server
        .server_reply_and_wait(&words(&[10], 1), &mut request)
        .expect("second request");
    assert_eq!(caller, second_identity);
    assert_eq!(request.words(), &[2]);
    server.server_reply(&words(&[20], 1));

    assert_eq!(first_call.join().expect("first client").0, Ok(vec![10]));
    assert_eq!(second_call.join().expect("second client").0, Ok(vec![20]));
}

pub fn messages_truncated_to_receiver<S: Substrate>() {
    let mut substrate = S::new();
    let mut server = substrate.port("server");
    let client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());

    let call = spawn_call(client, dest, &[1, 2, 3, 4, 5, 6], 3);
    let mut request = Msgbuf::with_capacity(2);
    server.server_wait(&mut request).expect("request arrives");
    assert_eq!(request.words(), &[1, 2]);
    server.server_reply(&words(&[9, 8, 7, 6, 5], 5));

    assert_eq!(call.join().expect("client thread").0, Ok(vec![9, 8, 7]));
}

pub fn invalid_destination<S: Substrate>() {
    let mut substrate = S::new();
    let mut client = substrate.port("client");
    let mut reply = Msgbuf::with_capacity(1);
    assert_eq!(
        client.client_call(&CapRef::invalid(), &words(&[1], 1), &mut reply),
        Err(IpcError::InvalidDestination)
    );
}

pub fn call_to_self_rejected<S: Substrate>() {
    let mut substrate = S::new();
    let mut client = substrate.port("client");
    let own = substrate.grant(&client, client.identity());
    let mut reply = Msgbuf::with_capacity(1);
    assert!(matches!(
        client.client_call(&own, &words(&[1], 1), &mut reply),
        Err(IpcError::InvalidState(_))
    ));
}

pub fn call_to_dead_server<S: Substrate>() {
    let mut substrate = S::new();
    let server = substrate.port("server");
    let mut client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());
    substrate.kill(server);

    let mut reply = Msgbuf::with_capacity(1);
    assert_eq!(
        client.client_call(&dest, &words(&[1], 1), &mut reply),
        Err(IpcError::Cancelled(CancelReason::PartnerGone))
    );
}

pub fn server_death_cancels_queued_caller<S: Substrate>() {
    let mut substrate = S::new();
    let server = substrate.port("server");
    let client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());

    let call = spawn_call(client, dest, &[1], 1);
    wait_until("the request is queued", || substrate.queued(&server) == 1);
    substrate.kill(server);

    assert_eq!(
        call.join().expect("client thread").0,
        Err(IpcError::Cancelled(CancelReason::PartnerGone))
    );
}

pub fn server_death_cancels_delivered_caller<S: Substrate>() {
    let mut substrate = S::new();
    let mut server = substrate.port("server");
    let client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());

    let call = spawn_call(client, dest, &[1], 1);
    let mut request = Msgbuf::with_capacity(1);
    server.server_wait(&mut request).expect("request arrives");
    substrate.kill(server);

    assert_eq!(
        call.join().expect("client thread").0,
        Err(IpcError::Cancelled(CancelReason::PartnerGone))
    );
}

pub fn reply_to_departed_caller_dropped<S: Substrate>() {
    let mut substrate = S::new();
    let mut server = substrate.port("server");
    let client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());
    let canceller = client.canceller();

    let call = spawn_call(client, dest, &[1], 1);
    let mut request = Msgbuf::with_capacity(1);
    server.server_wait(&mut request).expect("request arrives");
    assert!(canceller.cancel());
    let (result, client) = call.join().expect("client thread");
    assert_eq!(result, Err(IpcError::Cancelled(CancelReason::Aborted)));

    server.server_reply(&words(&[99], 1));

    let call = spawn_call(client, dest, &[2], 1);
    assert_eq!(serve_one(&mut server, &[3]), vec![2]);
    assert_eq!(call.join().expect("client thread").0, Ok(vec![3]));
}

pub fn reply_without_partner_is_noop<S: Substrate>() {
    let mut substrate = S::new();
    let mut server = substrate.port("server");
    let client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());

    server.server_reply(&words(&[1], 1));

    let call = spawn_call(client, dest, &[5], 1);
    assert_eq!(serve_one(&mut server, &[6]), vec![5]);
    assert_eq!(call.join().expect("client thread").0, Ok(vec![6]));
}

pub fn cancel_wait<S: Substrate>() {
    let mut substrate = S::new();
    let server = substrate.port("server");
    let client = substrate.port("client");
    let dest = substrate.grant(&client, server.identity());
    let canceller = server.canceller();
    assert!(!canceller.cancel());

    let wait = thread::spawn(move || {
        let mut server = server;
        let mut request = Msgbuf::with_capacity(1);
        let result = server.server_wait(&mut request);
        (result, server)
    });
    wait_until("the server wait is cancelled", || canceller.cancel());
    let (result, mut server) = wait.join().expect("server thread");
    assert_eq!(result, Err(IpcError::Cancelled(CancelReason::Aborted)));
    assert!(!canceller.cancel());

    let call = spawn_call(client, dest, &[7], 1);
    assert_eq!(serve_one(&mut server, &[8]), vec![7]);
    assert_eq!(call.join().expect("client thread").0, Ok(vec![8]));
}

pub fn capability_transfer<S: Substrate>() {
    let mut substrate = S::new();
    let mut client = substrate.port("client");
    let mut server = substrate.port("server");
    let mut target = substrate.port("target");
    let (server_identity, target_identity) = (server.identity(), target.identity());
    let to_server = substrate.grant(&client, server_identity);
    let to_target = substrate.grant(&client, target_identity);

    let target_thread = thread::spawn(move || {
        let mut request = Msgbuf::with_capacity(1);
        let caller = target.server_wait(&mut request).expect("forwarded request");
        let value: u64 = request.unmarshaller().next().expect("operand");
        target.server_reply(&words(&[value + 1], 1));
        (caller, target)
    });

    let server_thread = thread::spawn(move || {
        let mut request = Msgbuf::with_capacity(2);
        server.server_wait(&mut request).expect("request arrives");
        let mut args = request.unmarshaller();
        let forwarded = args.next_cap().expect("transferred capability");
        let missing = args.next_cap().expect("invalid capability");
        assert!(forwarded.is_valid());
        assert!(!missing.is_valid());

        let mut reply = Msgbuf::with_capacity(1);
        server
            .client_call(&forwarded, &words(&[41], 1), &mut reply)
            .expect("call through the transferred capability");
        server.server_reply(&reply);
        (forwarded.identity(), server)
    });

    let mut request = Msgbuf::with_capacity(2);
    request.push_cap(to_target).expect("capability fits");
    request.push_cap(CapRef::invalid()).expect("marker fits");
    let mut reply = Msgbuf::with_capacity(1);
    client
        .client_call(&to_server, &request, &mut reply)
        .expect("call completes");
    assert_eq!(reply.words(), &[42]);

    let (forwarded, _server) = server_thread.join().expect("server thread");
    assert_eq!(forwarded, Some(target_identity));
    let (caller, _target) = target_thread.join().expect("target thread");
    assert_eq!(caller, server_identity);
}
