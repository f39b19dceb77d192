//! Socket option baseline applied to every fd this crate creates or
//! accepts, grounded on `SockUtil::set*` in
//! `original_source/ZLToolKit/src/Network/sockutil.cpp`.

use std::io;
use std::os::unix::io::RawFd;

fn check(ret: libc::c_int, what: &str) -> io::Result<()> {
    if ret == -1 {
        let err = io::Error::last_os_error();
        log::trace!("{what} failed: {err}");
        Err(err)
    } else {
        Ok(())
    }
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> libc::c_int {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    }
}

/// `SO_REUSEADDR`, and `SO_REUSEPORT` where the platform defines it.
pub fn set_reuseable(fd: RawFd, on: bool, reuse_port: bool) -> io::Result<()> {
    let opt: libc::c_int = on as _;
    check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &opt), "SO_REUSEADDR")?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if reuse_port {
        check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, &opt), "SO_REUSEPORT")?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = reuse_port;
    Ok(())
}

pub fn set_no_delay(fd: RawFd, on: bool) -> io::Result<()> {
    let opt: libc::c_int = on as _;
    check(setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &opt), "TCP_NODELAY")
}

pub fn set_broadcast(fd: RawFd, on: bool) -> io::Result<()> {
    let opt: libc::c_int = on as _;
    check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, &opt), "SO_BROADCAST")
}

/// `SO_KEEPALIVE` plus, on Linux, the idle/interval/count tuning knobs.
pub fn set_keep_alive(fd: RawFd, on: bool, idle: libc::c_int, interval: libc::c_int, count: libc::c_int) -> io::Result<()> {
    let opt: libc::c_int = on as _;
    check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &opt), "SO_KEEPALIVE")?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if on && interval > 0 {
        check(setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, &idle), "TCP_KEEPIDLE")?;
        check(setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, &interval), "TCP_KEEPINTVL")?;
        check(setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &count), "TCP_KEEPCNT")?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = (idle, interval, count);
    Ok(())
}

/// `FD_CLOEXEC` via `fcntl`.
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on { flags | libc::FD_CLOEXEC } else { flags & !libc::FD_CLOEXEC };
    check(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) }, "F_SETFD FD_CLOEXEC")
}

/// Suppress `SIGPIPE` delivery on this fd, where the platform has
/// `SO_NOSIGPIPE` (BSD/macOS). On Linux this is a no-op; `MSG_NOSIGPIPE`
/// on each send call covers it instead, same as the original's `#else`.
pub fn set_no_sigpipe(fd: RawFd) -> io::Result<()> {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly"))]
    {
        let opt: libc::c_int = 1;
        return check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, &opt), "SO_NOSIGPIPE");
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly")))]
    {
        let _ = fd;
        Ok(())
    }
}

pub fn set_non_blocking(fd: RawFd, non_blocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if non_blocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }, "F_SETFL O_NONBLOCK")
}

/// `size <= 0` means "leave the system default alone", matching the
/// original's early-return.
pub fn set_recv_buf(fd: RawFd, size: libc::c_int) -> io::Result<()> {
    if size <= 0 {
        return Ok(());
    }
    check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, &size), "SO_RCVBUF")
}

pub fn set_send_buf(fd: RawFd, size: libc::c_int) -> io::Result<()> {
    if size <= 0 {
        return Ok(());
    }
    check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, &size), "SO_SNDBUF")
}

/// `SO_LINGER`; `seconds == 0` turns lingering off (`l_onoff = 0`).
pub fn set_close_wait(fd: RawFd, seconds: u16) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: (seconds > 0) as libc::c_int,
        l_linger: seconds as libc::c_int,
    };
    check(setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger), "SO_LINGER")
}

/// The baseline this crate applies to every fd it creates or accepts
/// (§6): non-blocking, `SO_REUSEADDR`, no `SIGPIPE`, close-on-exec, plus
/// the caller-tunable knobs below.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub reuse_addr: bool,
    pub nodelay: bool,
    pub keepalive: bool,
    pub sndbuf: Option<u32>,
    pub rcvbuf: Option<u32>,
    pub linger_secs: u16,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            reuse_addr: true,
            nodelay: true,
            keepalive: false,
            sndbuf: None,
            rcvbuf: None,
            linger_secs: 0,
        }
    }
}

/// Applies the non-blocking/close-on-exec/no-sigpipe baseline plus
/// `opts`. Called on every accepted or connected fd, grounded on the
/// common tail of `Socket::fromSock`/`onAccept`/`SockUtil::connect`.
pub fn apply(fd: RawFd, opts: &SocketOptions) -> io::Result<()> {
    set_no_sigpipe(fd)?;
    set_non_blocking(fd, true)?;
    set_cloexec(fd, true)?;
    set_reuseable(fd, opts.reuse_addr, false)?;
    set_no_delay(fd, opts.nodelay)?;
    set_keep_alive(fd, opts.keepalive, 120, 30, 9)?;
    if let Some(sz) = opts.sndbuf {
        set_send_buf(fd, sz as libc::c_int)?;
    }
    if let Some(sz) = opts.rcvbuf {
        set_recv_buf(fd, sz as libc::c_int)?;
    }
    set_close_wait(fd, opts.linger_secs)?;
    Ok(())
}
