//! BSD/macOS backend: `kqueue`/`kevent`.
//!
//! Grounded on the teacher's `src/sys/unix/selector/kqueue.rs` for the
//! per-platform `Filter`/`Data` type aliases, and on the kqueue branch of
//! `original_source/ZLToolKit/src/Poller/EventPoller.cpp::addEvent`/
//! `delEvent`/`modifyEvent`/`runLoop` for the filter semantics: read and
//! write interest are independent `EVFILT_READ`/`EVFILT_WRITE` filters
//! rather than one combined readiness mask.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{would_retry, PollEvent, Readiness, EVENT_CAPACITY};

type Count = libc::c_int;

#[derive(Debug)]
pub struct Selector {
    kq: OwnedFd,
}

// `EVFILT_*`/`EV_*` are `i16`/`u16` on every BSD/macOS target this selector
// supports, matching `libc::kevent`'s `filter`/`flags` fields directly.
fn change(fd: RawFd, filter: libc::c_short, flags: libc::c_ushort) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Selector {
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn apply(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as Count,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn register(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if events.contains(PollEvent::READ) {
            changes.push(change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR));
        }
        if events.contains(PollEvent::WRITE) {
            changes.push(change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR));
        }
        self.apply(&mut changes)
    }

    /// `EV_ADD` for filters the caller now wants, `EV_DELETE` for the other
    /// one — matches `modifyEvent`'s kqueue branch exactly.
    pub fn reregister(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let read_flags = if events.contains(PollEvent::READ) {
            libc::EV_ADD | libc::EV_CLEAR
        } else {
            libc::EV_DELETE
        };
        let write_flags = if events.contains(PollEvent::WRITE) {
            libc::EV_ADD | libc::EV_CLEAR
        } else {
            libc::EV_DELETE
        };
        let mut changes = vec![
            change(fd, libc::EVFILT_READ, read_flags),
            change(fd, libc::EVFILT_WRITE, write_flags),
        ];
        self.apply(&mut changes)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = vec![
            change(fd, libc::EVFILT_READ, libc::EV_DELETE),
            change(fd, libc::EVFILT_WRITE, libc::EV_DELETE),
        ];
        // best-effort: a filter that was never added returns ENOENT
        let _ = self.apply(&mut changes);
        Ok(())
    }

    pub fn select(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let mut events = vec![unsafe { std::mem::zeroed::<libc::kevent>() }; EVENT_CAPACITY];
        loop {
            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    EVENT_CAPACITY as Count,
                    ts.as_ref().map_or(std::ptr::null(), |t| t as *const _),
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
                    fd: ev.ident as RawFd,
                    events: match ev.filter {
                        libc::EVFILT_READ => PollEvent::READ,
                        libc::EVFILT_WRITE => PollEvent::WRITE,
                        _ => PollEvent::NONE,
                    },
                })
                .collect());
        }
    }
}
