//! S5 (scaled down): connecting to a black-holed address fires `on_err`
//! with `Timeout` within the configured window, and leaves no fd behind.

mod util;

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactorcore::error::SockError;
use reactorcore::{EventPoller, Socket};

#[test]
fn connect_to_black_hole_times_out() {
    util::init();

    let poller = EventPoller::new("connect-timeout-test").unwrap();
    poller.run(false, true).unwrap();
    let sock = Socket::create(Some(poller));

    let (tx, rx) = channel();
    let started = Instant::now();
    // TEST-NET-3 (RFC 5737), reserved for documentation: routable but
    // guaranteed to never answer on a CI/dev box, which is what "black
    // holed" requires here.
    sock.connect("203.0.113.1", 80, move |result| {
        let _ = tx.send(result);
    }, 1.0, None);

    let result = rx.recv_timeout(Duration::from_millis(1_200)).expect("on_err never fired");
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SockError::Timeout)), "expected Timeout, got {result:?}");
    assert!(elapsed >= Duration::from_millis(900), "fired too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1_200), "fired too late: {elapsed:?}");
    assert_eq!(sock.raw_fd(), -1, "fd should have been cleaned up on failure");
}
