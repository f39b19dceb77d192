//! S6 (scaled down): a peer that never reads eventually trips
//! `on_err(Timeout)`, and both send queues are empty by the time that
//! callback runs.

mod util;

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reactorcore::error::SockError;
use reactorcore::{Buf, EventPoller, RawBuffer, Session, Socket, SocketOptions, TcpServer};

const BACKPRESSURE_MS: u64 = 150;
// Scaled down from the spec's 16 MiB — small enough for the test to run
// quickly, large enough to overflow an 8 KiB socket buffer in one write.
const CHUNK_SIZE: usize = 256 * 1024;

#[test]
fn send_backpressure_times_out_and_drains_queues() {
    util::init();

    let poller = EventPoller::new("send-backpressure-test").unwrap();
    poller.run(false, true).unwrap();
    let server = TcpServer::new(Some(poller));

    server.set_on_create_socket(|poller| {
        let sock = Socket::create(Some(poller.clone()));
        sock.set_options(SocketOptions {
            sndbuf: Some(8 * 1024),
            rcvbuf: Some(8 * 1024),
            ..Default::default()
        });
        sock
    });

    let fired = Arc::new(AtomicBool::new(false));
    let fired_at = Arc::new(Mutex::new(None));
    let (sock_tx, sock_rx) = channel();

    let fired2 = fired.clone();
    let fired_at2 = fired_at.clone();

    server
        .start(
            0,
            "127.0.0.1",
            128,
            |sock| Arc::new(Session::new(sock)),
            move |session: &Arc<Session>| {
                let sock = session.helper().get_sock();
                sock.set_send_timeout_ms(BACKPRESSURE_MS);

                let fired3 = fired2.clone();
                let fired_at3 = fired_at2.clone();
                let started = Instant::now();
                sock.set_on_err(move |err| {
                    if matches!(err, SockError::Timeout) && !fired3.swap(true, Ordering::SeqCst) {
                        *fired_at3.lock().unwrap() = Some(started.elapsed());
                    }
                });

                let _ = sock_tx.send(sock);
            },
        )
        .unwrap();

    let addr = format!("127.0.0.1:{}", server.get_port());
    let client = TcpStream::connect(&addr).unwrap();

    let sock = sock_rx.recv_timeout(Duration::from_secs(1)).expect("no connection accepted");

    let deadline = Instant::now() + Duration::from_millis(BACKPRESSURE_MS + 600);
    while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
        let payload: Arc<dyn Buf> = Arc::new(RawBuffer::from_bytes(vec![0u8; CHUNK_SIZE]));
        sock.send(payload, true);
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(fired.load(Ordering::SeqCst), "expected a send timeout within the deadline");
    let elapsed = fired_at.lock().unwrap().unwrap();
    assert!(elapsed >= Duration::from_millis(BACKPRESSURE_MS));
    assert!(elapsed <= Duration::from_millis(BACKPRESSURE_MS + 600));

    // Give `close_sock`, which runs right after the `on_err` callback
    // returns, a moment to drain both queues.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sock.get_send_buffer_count(), 0);

    drop(client);
}
