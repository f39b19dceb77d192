//! Self-pipe used to wake a poller thread blocked in `epoll_wait`/`kevent`.
//!
//! Grounded on `sys/unix/waker/pipe.rs` in the teacher and on `PipeWrap` in
//! `original_source/ZLToolKit/src/Poller/PipeWrap.h`: a non-blocking pipe
//! whose read end is registered with the selector. `wake` writes a single
//! byte; `drain` (the original's `onPipeEvent`) empties the pipe so the
//! read-ready edge doesn't keep re-firing.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

#[derive(Debug)]
pub struct Waker {
    sender: UnixStream,
    receiver: UnixStream,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let (receiver, sender) = UnixStream::pair()?;
        receiver.set_nonblocking(true)?;
        sender.set_nonblocking(true)?;
        Ok(Waker { sender, receiver })
    }

    pub fn read_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    /// Wake the poller. Idempotent: if the pipe buffer is already full the
    /// poller is already due to wake up, so `WouldBlock` is not an error.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empty the pipe. Called from the read-ready callback; the byte values
    /// carry no information, only the wakeup matters.
    pub fn drain(&self) {
        let mut buf = [0u8; 1024];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}
