//! Linux backend: `epoll_create1`/`epoll_ctl`/`epoll_wait`.
//!
//! Grounded on the teacher's `src/sys/unix/selector/epoll.rs` for the
//! `OwnedFd` + retry-on-`EINTR` shape, and on the `toEpoll`/`toPoller`
//! macros in `original_source/ZLToolKit/src/Poller/EventPoller.cpp` for the
//! readiness-bit mapping.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{would_retry, PollEvent, Readiness, EVENT_CAPACITY};

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

fn to_epoll(events: PollEvent) -> u32 {
    let mut bits = 0u32;
    if events.contains(PollEvent::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.contains(PollEvent::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    if events.contains(PollEvent::ERROR) {
        bits |= (libc::EPOLLHUP | libc::EPOLLERR) as u32;
    }
    if !events.contains(PollEvent::LEVEL) {
        bits |= libc::EPOLLET as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> PollEvent {
    let mut out = PollEvent::NONE;
    if bits & (libc::EPOLLIN | libc::EPOLLRDNORM | libc::EPOLLHUP) as u32 != 0 {
        out |= PollEvent::READ;
    }
    if bits & (libc::EPOLLOUT | libc::EPOLLWRNORM) as u32 != 0 {
        out |= PollEvent::WRITE;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        out |= PollEvent::ERROR;
    }
    out
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Selector {
            ep: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn register(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, &mut ev)
    }

    pub fn reregister(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, &mut ev)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, ev: *mut libc::epoll_event) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), op, fd, ev) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Block for up to `timeout` (`None` blocks forever), returning the
    /// ready fds. Retries internally on `EINTR`.
    pub fn select(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let mut events = vec![unsafe { std::mem::zeroed::<libc::epoll_event>() }; EVENT_CAPACITY];
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.ep.as_raw_fd(),
                    events.as_mut_ptr(),
                    EVENT_CAPACITY as i32,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if would_retry(&err) {
                    continue;
                }
                return Err(err);
            }
            return Ok(events[..n as usize]
                .iter()
                .map(|ev| Readiness {
                    fd: ev.u64 as RawFd,
                    events: from_epoll(ev.events),
                })
                .collect());
        }
    }
}
