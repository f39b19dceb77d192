//! Scatter/gather batches of buffers treated as one kernel write.
//!
//! Grounded on the `Socket::flushData`/`BufferList::send` split in
//! `src/network/socket.cc` and `BufferSock.h`. Three concrete variants are
//! selected once per `Socket`, per the platform table in spec §4.4:
//!
//! - [`VectoredList`] — `sendmsg` over up to `IOV_MAX` iovecs; used for TCP.
//! - [`BatchedDatagramList`] — `sendmmsg` over an array of `mmsghdr`; used
//!   for UDP on Linux.
//! - [`PerMessageList`] — iterate and call `sendto`; used for addressed UDP
//!   on platforms without `sendmmsg` (and is also the portable fallback
//!   this crate uses on non-Linux Unixes).

use crate::buffer_sock::BufferSock;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Fired once per buffer as it leaves the batch, successfully or not.
pub type SendResultCb = Arc<dyn Fn(&BufferSock, bool) + Send + Sync>;

/// A scatter/gather batch. Once constructed the buffer list is frozen:
/// `Socket::flush_all` promotes the waiting list into one of these, and
/// `flush_data` drains it without recopying on partial sends.
pub trait BufferList: Send {
    /// Push as much of the batch to the kernel as will go without
    /// blocking. Returns `Ok(true)` once the whole batch has drained
    /// (caller pops it), `Ok(false)` if the kernel returned `EAGAIN` with
    /// data still queued, `Err` on any other errno.
    fn send(&mut self, fd: RawFd, result_cb: Option<&SendResultCb>) -> io::Result<bool>;

    fn is_empty(&self) -> bool;

    /// Number of buffers still queued (for `Socket::get_send_buffer_count`).
    fn count(&self) -> usize;
}

fn fire(cb: Option<&SendResultCb>, buf: &BufferSock, ok: bool) {
    if let Some(cb) = cb {
        cb(buf, ok);
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock)
}

/// TCP path: one `sendmsg` call over all remaining iovecs. Tracks a
/// cumulative "bytes consumed" counter so a partial write resumes at the
/// right iovec/offset without copying, and so per-buffer completion can
/// be derived from how many whole buffers that byte count covers.
pub struct VectoredList {
    bufs: VecDeque<BufferSock>,
    consumed_in_front: usize,
}

impl VectoredList {
    pub fn new(bufs: VecDeque<BufferSock>) -> Self {
        VectoredList {
            bufs,
            consumed_in_front: 0,
        }
    }

    fn build_iovecs(&self) -> Vec<libc::iovec> {
        const IOV_MAX: usize = 1024;
        let mut iovecs = Vec::with_capacity(self.bufs.len().min(IOV_MAX));
        for (i, b) in self.bufs.iter().enumerate() {
            if i == 0 {
                let data = &b.buf.data()[self.consumed_in_front..];
                iovecs.push(libc::iovec {
                    iov_base: data.as_ptr() as *mut libc::c_void,
                    iov_len: data.len(),
                });
            } else {
                let data = b.buf.data();
                iovecs.push(libc::iovec {
                    iov_base: data.as_ptr() as *mut libc::c_void,
                    iov_len: data.len(),
                });
            }
            if iovecs.len() == IOV_MAX {
                break;
            }
        }
        iovecs
    }
}

impl BufferList for VectoredList {
    fn send(&mut self, fd: RawFd, result_cb: Option<&SendResultCb>) -> io::Result<bool> {
        while !self.bufs.is_empty() {
            let iovecs = self.build_iovecs();
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = iovecs.len() as _;

            let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if would_block(&err) {
                    return Ok(false);
                }
                return Err(err);
            }

            let mut remaining = n as usize;
            while remaining > 0 {
                let front = self
                    .bufs
                    .front()
                    .expect("sendmsg reported bytes for an empty queue");
                let front_remaining = front.len() - self.consumed_in_front;
                if remaining < front_remaining {
                    self.consumed_in_front += remaining;
                    remaining = 0;
                } else {
                    remaining -= front_remaining;
                    let done = self.bufs.pop_front().unwrap();
                    self.consumed_in_front = 0;
                    fire(result_cb, &done, true);
                }
            }
        }
        Ok(true)
    }

    fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn count(&self) -> usize {
        self.bufs.len()
    }
}

/// UDP path without `sendmmsg`: one `sendto` per datagram.
pub struct PerMessageList {
    bufs: VecDeque<BufferSock>,
}

impl PerMessageList {
    pub fn new(bufs: VecDeque<BufferSock>) -> Self {
        PerMessageList { bufs }
    }
}

impl BufferList for PerMessageList {
    fn send(&mut self, fd: RawFd, result_cb: Option<&SendResultCb>) -> io::Result<bool> {
        while let Some(front) = self.bufs.front() {
            let data = front.buf.data();
            let storage = front.dest.map(SockAddrStorage::from);
            let (addr_ptr, addr_len) = match &storage {
                Some(s) => (s.as_ptr(), s.len()),
                None => (std::ptr::null(), 0),
            };
            let n = unsafe {
                libc::sendto(
                    fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    libc::MSG_NOSIGNAL,
                    addr_ptr,
                    addr_len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if would_block(&err) {
                    return Ok(false);
                }
                // UDP send errors on a single datagram are dropped, not escalated.
                log::warn!("udp sendto failed, dropping datagram: {err}");
                let done = self.bufs.pop_front().unwrap();
                fire(result_cb, &done, false);
                continue;
            }
            let done = self.bufs.pop_front().unwrap();
            fire(result_cb, &done, true);
        }
        Ok(true)
    }

    fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn count(&self) -> usize {
        self.bufs.len()
    }
}

/// UDP path on Linux: `sendmmsg` over an array of `mmsghdr`.
#[cfg(target_os = "linux")]
pub struct BatchedDatagramList {
    bufs: VecDeque<BufferSock>,
}

#[cfg(target_os = "linux")]
impl BatchedDatagramList {
    pub fn new(bufs: VecDeque<BufferSock>) -> Self {
        BatchedDatagramList { bufs }
    }
}

#[cfg(target_os = "linux")]
impl BufferList for BatchedDatagramList {
    fn send(&mut self, fd: RawFd, result_cb: Option<&SendResultCb>) -> io::Result<bool> {
        const BATCH: usize = 32;
        while !self.bufs.is_empty() {
            let batch_len = self.bufs.len().min(BATCH);
            // storage kept alive for the duration of the syscall
            let mut iovecs = vec![unsafe { std::mem::zeroed::<libc::iovec>() }; batch_len];
            let mut addrs = vec![unsafe { std::mem::zeroed::<libc::sockaddr_storage>() }; batch_len];
            let mut addr_lens = vec![0u32; batch_len];
            let mut hdrs = vec![unsafe { std::mem::zeroed::<libc::mmsghdr>() }; batch_len];

            for (i, item) in self.bufs.iter().take(batch_len).enumerate() {
                let data = item.buf.data();
                iovecs[i] = libc::iovec {
                    iov_base: data.as_ptr() as *mut libc::c_void,
                    iov_len: data.len(),
                };
                if let Some(addr) = &item.dest {
                    let storage = SockAddrStorage::from(*addr);
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            storage.as_ptr() as *const u8,
                            &mut addrs[i] as *mut _ as *mut u8,
                            storage.len() as usize,
                        );
                    }
                    addr_lens[i] = storage.len();
                }
                hdrs[i].msg_hdr.msg_iov = &mut iovecs[i];
                hdrs[i].msg_hdr.msg_iovlen = 1;
                if addr_lens[i] > 0 {
                    hdrs[i].msg_hdr.msg_name = &mut addrs[i] as *mut _ as *mut libc::c_void;
                    hdrs[i].msg_hdr.msg_namelen = addr_lens[i];
                }
            }

            let sent = unsafe {
                libc::sendmmsg(fd, hdrs.as_mut_ptr(), batch_len as u32, libc::MSG_NOSIGNAL as _)
            };
            if sent < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if would_block(&err) {
                    return Ok(false);
                }
                log::warn!("sendmmsg failed, dropping batch: {err}");
                for _ in 0..batch_len {
                    if let Some(done) = self.bufs.pop_front() {
                        fire(result_cb, &done, false);
                    }
                }
                continue;
            }
            for _ in 0..sent {
                if let Some(done) = self.bufs.pop_front() {
                    fire(result_cb, &done, true);
                }
            }
            if (sent as usize) < batch_len {
                // kernel accepted fewer than offered; remaining stay queued
                return Ok(self.bufs.is_empty());
            }
        }
        Ok(true)
    }

    fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn count(&self) -> usize {
        self.bufs.len()
    }
}

/// One-time selection of the batching strategy, per spec §4.4's table and
/// the "must not change for the life of the process" note in §9.
pub fn build_for(is_udp: bool, bufs: VecDeque<BufferSock>) -> Box<dyn BufferList> {
    if is_udp {
        #[cfg(target_os = "linux")]
        {
            Box::new(BatchedDatagramList::new(bufs))
        }
        #[cfg(not(target_os = "linux"))]
        {
            Box::new(PerMessageList::new(bufs))
        }
    } else {
        Box::new(VectoredList::new(bufs))
    }
}

/// Owned, stack-allocated `sockaddr_in`/`sockaddr_in6` storage so
/// `sendto`/`sendmmsg` callers get a live pointer without heap traffic
/// per datagram.
enum SockAddrStorage {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl From<std::net::SocketAddr> for SockAddrStorage {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sa.sin_family = libc::AF_INET as _;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                SockAddrStorage::V4(sa)
            }
            std::net::SocketAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sa.sin6_family = libc::AF_INET6 as _;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.s6_addr = v6.ip().octets();
                SockAddrStorage::V6(sa)
            }
        }
    }
}

impl SockAddrStorage {
    fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            SockAddrStorage::V4(sa) => sa as *const _ as *const libc::sockaddr,
            SockAddrStorage::V6(sa) => sa as *const _ as *const libc::sockaddr,
        }
    }

    fn len(&self) -> libc::socklen_t {
        match self {
            SockAddrStorage::V4(_) => std::mem::size_of::<libc::sockaddr_in>() as _,
            SockAddrStorage::V6(_) => std::mem::size_of::<libc::sockaddr_in6>() as _,
        }
    }
}
