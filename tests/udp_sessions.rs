//! S4 (scaled down): one UDP server, two peers send datagrams. Exactly one
//! session gets created per peer, keyed by the peer's ephemeral port (the
//! per-datagram-delivery half of S4 isn't exercised here — this crate's
//! `UdpServer::dispatch` deliberately leaves payload routing to the
//! consumer's own socket wiring rather than a virtual `onRecv`, see
//! `DESIGN.md`'s net/udp_server.rs entry).

mod util;

use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactorcore::{EventPoller, Session, UdpServer};

#[test]
fn one_session_created_per_udp_peer() {
    util::init();

    let poller = EventPoller::new("udp-sessions-test").unwrap();
    poller.run(false, true).unwrap();
    let server = UdpServer::new(Some(poller));

    let created = Arc::new(AtomicUsize::new(0));
    let created_for_session = created.clone();

    server
        .start(
            0,
            "127.0.0.1",
            |sock| Arc::new(Session::new(sock)),
            move |_session| {
                created_for_session.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    let addr = format!("127.0.0.1:{}", server.get_port());

    let client_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").unwrap();

    for i in 0..10u8 {
        client_a.send_to(&[i], &addr).unwrap();
        client_b.send_to(&[i], &addr).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(created.load(Ordering::SeqCst), 2);
}
