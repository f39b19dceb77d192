//! `sockaddr_storage` <-> `std::net::SocketAddr` conversions used by the
//! raw connect/listen/accept/getsockname path.
//!
//! Grounded on `from_socket_addr`/`to_socket_addr` in the teacher's
//! `src/sys/unix/net.rs`.

use std::io;
use std::mem::size_of_val;
use std::net::SocketAddr;

pub(crate) fn from_socket_addr(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => (
            a as *const _ as *const libc::sockaddr,
            size_of_val(a) as libc::socklen_t,
        ),
        SocketAddr::V6(a) => (
            a as *const _ as *const libc::sockaddr,
            size_of_val(a) as libc::socklen_t,
        ),
    }
}

/// `storage` must have been filled in by a `getsockname`/`getpeername`/
/// `accept` call (or be zeroed, which is a valid `sockaddr`).
pub(crate) unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => Ok(SocketAddr::V4(*(storage as *const libc::sockaddr_in as *const _))),
        libc::AF_INET6 => Ok(SocketAddr::V6(*(storage as *const libc::sockaddr_in6 as *const _))),
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}
