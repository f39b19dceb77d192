//! The scratch buffer `EventPoller::get_shared_buffer` hands out, cached
//! one-per-poller-per-protocol so repeat `recv`/`recvfrom` calls on
//! different sockets don't each allocate their own arena.
//!
//! Grounded on `SocketRecvBuffer` in `original_source/src/network/socket.cc`
//! (`Socket::attachEvent`'s `getSharedBuffer(is_udp)` call and `onRead`'s
//! `recvFromSocket`).

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::buffer::RawBuffer;
use crate::socket::addr::to_socket_addr;

const DEFAULT_CAPACITY: usize = 256 * 1024;

pub struct SocketRecvBuffer {
    scratch: Mutex<RawBuffer>,
}

impl Default for SocketRecvBuffer {
    fn default() -> SocketRecvBuffer {
        SocketRecvBuffer {
            scratch: Mutex::new(RawBuffer::with_capacity(DEFAULT_CAPACITY)),
        }
    }
}

impl SocketRecvBuffer {
    /// One `recv`/`recvfrom` into the shared scratch space, copied out
    /// immediately so the next caller on this poller thread can reuse it.
    /// `Ok((bytes, addr))` with an empty `bytes` means EOF, matching
    /// `onRead`'s `nread == 0` branch.
    pub fn recv_from(&self, fd: RawFd, is_udp: bool) -> io::Result<(Vec<u8>, Option<SocketAddr>)> {
        let mut scratch = self.scratch.lock().unwrap();
        scratch.set_capacity(DEFAULT_CAPACITY);
        let spare = scratch.spare_mut();

        if is_udp {
            let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
            let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    spare.as_mut_ptr() as *mut libc::c_void,
                    spare.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            scratch.set_size(n as usize);
            let addr = unsafe { to_socket_addr(&storage) }.ok();
            Ok((scratch.data().to_vec(), addr))
        } else {
            let n = unsafe { libc::recv(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len(), 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            scratch.set_size(n as usize);
            Ok((scratch.data().to_vec(), None))
        }
    }
}
