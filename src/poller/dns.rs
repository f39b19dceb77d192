//! Off-thread DNS resolution.
//!
//! `getaddrinfo` is the one blocking call `Socket::connect` needs to make
//! (§5), so it never runs on a poller thread. Grounded on `WorkThreadPool`
//! in `original_source/ZLToolKit/src/Thread/WorkThreadPool.h`: a small
//! fixed-size worker pool, separate from the `EventPoller` pool, that exists
//! purely to host blocking calls. Results are posted back to the caller's
//! poller via [`EventPoller::async_task`], exactly as `Socket::connect_l`'s
//! DNS branch does in `socket.cc`.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use super::event_poller::EventPoller;

const DNS_POOL_SIZE: usize = 4;

type Job = Box<dyn FnOnce() + Send>;

pub struct DnsPool {
    sender: mpsc::Sender<Job>,
}

impl DnsPool {
    pub fn instance() -> &'static DnsPool {
        static INSTANCE: OnceLock<DnsPool> = OnceLock::new();
        INSTANCE.get_or_init(DnsPool::new)
    }

    fn new() -> DnsPool {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..DNS_POOL_SIZE {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("dns resolver {i}"))
                .spawn(move || loop {
                    let job = { rx.lock().unwrap().recv() };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("failed to start dns resolver thread");
        }
        DnsPool { sender: tx }
    }

    /// Resolves `host:port` on a worker thread; `on_done` runs back on
    /// `poller`'s own thread with the result.
    pub fn resolve(
        &self,
        host: String,
        port: u16,
        poller: Arc<EventPoller>,
        on_done: impl FnOnce(io::Result<Vec<SocketAddr>>) + Send + 'static,
    ) {
        let host_for_log = host.clone();
        let job: Job = Box::new(move || {
            let result = (host.as_str(), port)
                .to_socket_addrs()
                .map(|it| it.collect::<Vec<_>>());
            let mut on_done = Some(on_done);
            poller.async_task(move || {
                if let Some(cb) = on_done.take() {
                    // the Result doesn't implement Clone; only one
                    // poller-thread invocation of this FnMut will ever
                    // actually run it.
                    cb(match &result {
                        Ok(addrs) => Ok(addrs.clone()),
                        Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
                    });
                }
            });
        });
        if self.sender.send(job).is_err() {
            log::error!("dns resolver pool is gone, dropping resolve({host_for_log})");
        }
    }
}
