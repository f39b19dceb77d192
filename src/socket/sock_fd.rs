//! Raw fd ownership, split from `Socket` the way the original splits
//! `SockNum` (owns the fd, closed once) from `SockFd` (one poller
//! registration over a possibly-shared `SockNum`).
//!
//! Grounded on `SockNum`/`SockFd` in
//! `original_source/src/network/socket.cc`: `cloneSocket` lets one listening
//! fd be registered with every poller in the pool, so the fd's lifetime
//! (`SockNum`) and a single poller registration of it (`SockFd`) are
//! separate, reference-counted independently.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::poller::EventPoller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp,
    TcpServer,
    Udp,
}

/// Owns `fd`; `shutdown`+`close` on drop, matching `SockNum::~SockNum`.
#[derive(Debug)]
pub struct SockNum {
    fd: RawFd,
    ty: SockType,
}

impl SockNum {
    pub fn new(fd: RawFd, ty: SockType) -> Arc<SockNum> {
        Arc::new(SockNum { fd, ty })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn sock_type(&self) -> SockType {
        self.ty
    }
}

impl Drop for SockNum {
    fn drop(&mut self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
            libc::close(self.fd);
        }
    }
}

/// One poller's registration of a `SockNum`. Removes its event registration
/// (not the fd itself — that's `SockNum`'s job) on drop, matching
/// `SockFd::~SockFd` calling `delEvent`.
pub struct SockFd {
    num: Arc<SockNum>,
    poller: Mutex<Option<Arc<EventPoller>>>,
}

impl SockFd {
    pub fn new(num: Arc<SockNum>, poller: Arc<EventPoller>) -> Arc<SockFd> {
        Arc::new(SockFd {
            num,
            poller: Mutex::new(Some(poller)),
        })
    }

    /// A second registration of the same `SockNum` with a different poller.
    /// Panics if `poller` is the one `that` is already registered with —
    /// matches the original's `throw std::invalid_argument` guard.
    pub fn cloned_with(that: &SockFd, poller: Arc<EventPoller>) -> Arc<SockFd> {
        if let Some(existing) = that.poller.lock().unwrap().as_ref() {
            assert!(
                !Arc::ptr_eq(existing, &poller),
                "cannot register a SockFd with the poller it already uses"
            );
        }
        SockFd::new(that.num.clone(), poller)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.num.raw_fd()
    }

    pub fn sock_num(&self) -> &Arc<SockNum> {
        &self.num
    }

    pub fn sock_type(&self) -> SockType {
        self.num.sock_type()
    }

    pub fn poller(&self) -> Option<Arc<EventPoller>> {
        self.poller.lock().unwrap().clone()
    }

    pub fn del_event(&self) {
        let poller = self.poller.lock().unwrap().take();
        if let Some(poller) = poller {
            let _ = poller.del_event(self.num.raw_fd(), None);
        }
    }
}

impl Drop for SockFd {
    fn drop(&mut self) {
        self.del_event();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn cloning_onto_the_same_poller_panics() {
        let poller = EventPoller::new("test").unwrap();
        let num = SockNum::new(-1, SockType::Tcp);
        let fd = SockFd {
            num,
            poller: Mutex::new(Some(poller.clone())),
        };
        SockFd::cloned_with(&fd, poller);
    }
}
