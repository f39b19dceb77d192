//! S1 (scaled down): a handful of TCP clients hammer an echo server and
//! every byte they send comes back, with zero `on_err` along the way.

mod util;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactorcore::{EventPoller, Session, TcpServer};

const CLIENTS: usize = 4;
const ROUNDS: usize = 8;
const CHUNK: &[u8] = b"the quick brown fox jumps over the lazy dog";

#[test]
fn tcp_echo_round_trip_with_no_errors() {
    util::init();

    let poller = EventPoller::new("tcp-echo-test").unwrap();
    poller.run(false, true).unwrap();
    let server = TcpServer::new(Some(poller));

    let err_count = Arc::new(AtomicUsize::new(0));
    let errs_for_session = err_count.clone();

    server
        .start(
            0,
            "127.0.0.1",
            128,
            |sock| Arc::new(Session::new(sock)),
            move |session| {
                let echo = Arc::clone(session);
                session.helper().get_sock().set_on_read(move |buf, _addr| {
                    echo.helper().send(buf);
                });
                let errs = errs_for_session.clone();
                session.helper().get_sock().set_on_err(move |_err| {
                    errs.fetch_add(1, Ordering::SeqCst);
                });
            },
        )
        .unwrap();

    let addr = format!("127.0.0.1:{}", server.get_port());

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let addr = addr.clone();
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(&addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                let mut received = Vec::new();
                for _ in 0..ROUNDS {
                    stream.write_all(CHUNK).unwrap();
                    let mut buf = [0u8; 256];
                    let mut got = 0;
                    while got < CHUNK.len() {
                        let n = stream.read(&mut buf[got..]).unwrap();
                        assert!(n > 0, "server closed early");
                        got += n;
                    }
                    received.extend_from_slice(&buf[..got]);
                    std::thread::sleep(Duration::from_millis(10));
                }
                received
            })
        })
        .collect();

    for handle in handles {
        let received = handle.join().unwrap();
        assert_eq!(received.len(), CHUNK.len() * ROUNDS);
        for round in received.chunks(CHUNK.len()) {
            assert_eq!(round, CHUNK);
        }
    }

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(err_count.load(Ordering::SeqCst), 0);
}
