//! Thin syscall wrappers: socket/connect/bind/listen/accept plus the
//! getsockname/getpeername/SO_ERROR helpers `Socket` needs.
//!
//! Grounded on the teacher's `src/sys/unix/socket.rs` `Socket` wrapper
//! (non-blocking + close-on-exec at creation time, `EINPROGRESS` treated as
//! success for a non-blocking connect) and on `SockUtil::listen`/`connect`/
//! `bindUdpSock`/`getSockError` in
//! `original_source/ZLToolKit/src/Network/sockutil.cpp` for the
//! bind-before-connect and reuseaddr-before-listen ordering.

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use super::addr::{from_socket_addr, to_socket_addr};
use super::options;

fn syscall(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn new_socket(domain: libc::c_int, ty: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    if let Err(err) = options::set_non_blocking(fd, true).and_then(|_| options::set_cloexec(fd, true)) {
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

fn domain_of(addr: SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

fn bind(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (ptr, len) = from_socket_addr(&addr);
    syscall(unsafe { libc::bind(fd, ptr, len) }).map(|_| ())
}

/// Non-blocking TCP connect: returns the fd immediately whether or not the
/// handshake has completed (`EINPROGRESS`/`EAGAIN` both treated as "in
/// flight", matching `SockUtil::connect`'s async branch). Caller watches
/// the fd become writable and then calls [`take_error`] to learn the
/// outcome.
pub fn tcp_connect(addr: SocketAddr, local: Option<SocketAddr>, opts: &options::SocketOptions) -> io::Result<RawFd> {
    let fd = new_socket(domain_of(addr), libc::SOCK_STREAM)?;
    let close_on_err = |err: io::Error| {
        unsafe { libc::close(fd) };
        err
    };
    options::apply(fd, opts).map_err(close_on_err)?;
    if let Some(local) = local {
        bind(fd, local).map_err(close_on_err)?;
    }
    let (ptr, len) = from_socket_addr(&addr);
    match syscall(unsafe { libc::connect(fd, ptr, len) }) {
        Ok(_) => Ok(fd),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(fd),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(fd),
        Err(err) => Err(close_on_err(err)),
    }
}

pub fn tcp_listen(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = new_socket(domain_of(addr), libc::SOCK_STREAM)?;
    let close_on_err = |err: io::Error| {
        unsafe { libc::close(fd) };
        err
    };
    options::set_reuseable(fd, true, false).map_err(close_on_err)?;
    bind(fd, addr).map_err(close_on_err)?;
    syscall(unsafe { libc::listen(fd, backlog) }).map_err(close_on_err)?;
    Ok(fd)
}

pub fn udp_bind(addr: SocketAddr, reuse: bool) -> io::Result<RawFd> {
    let fd = new_socket(domain_of(addr), libc::SOCK_DGRAM)?;
    let close_on_err = |err: io::Error| {
        unsafe { libc::close(fd) };
        err
    };
    options::set_reuseable(fd, reuse, reuse).map_err(close_on_err)?;
    bind(fd, addr).map_err(close_on_err)?;
    Ok(fd)
}

pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
    let peer_fd = loop {
        let ret = unsafe {
            libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break ret;
    };
    options::set_non_blocking(peer_fd, true)?;
    options::set_cloexec(peer_fd, true)?;
    let addr = unsafe { to_socket_addr(&storage) }?;
    Ok((peer_fd, addr))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
    syscall(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    unsafe { to_socket_addr(&storage) }
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
    syscall(unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    unsafe { to_socket_addr(&storage) }
}

/// `SO_ERROR`: the pending error a non-blocking connect or a prior failed
/// operation left on the socket. `Ok(())` means no pending error.
pub fn take_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Hard-binds a UDP socket's default destination (`connect(2)` on a
/// datagram socket), matching `Socket::bindPeerAddr`'s non-soft-bind path.
pub fn connect_peer(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (ptr, len) = from_socket_addr(&addr);
    syscall(unsafe { libc::connect(fd, ptr, len) }).map(|_| ())
}
