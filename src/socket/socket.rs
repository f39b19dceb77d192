//! The `Socket` state machine: connect/listen/accept/receive, the
//! two-stage send queue, and the capability callbacks session code hooks.
//!
//! Grounded throughout on `Socket` in `original_source/src/network/socket.cc`.
//! Method names below track the original one-for-one
//! (`connect`/`connect_l`, `on_connected`, `attach_event`, `on_read`,
//! `emit_err`, `flush_all`/`flush_data`, `on_accept`, `on_write_able`,
//! `start_write_able_event`/`stop_write_able_event`) so the grounding stays
//! legible method-by-method.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::{Buf, RawBuffer};
use crate::buffer_list::{self, BufferList, SendResultCb};
use crate::buffer_sock::BufferSock;
use crate::error::SockError;
use crate::poller::{EventPoller, PollEvent};
use crate::poller::dns::DnsPool;
use crate::poller::pool::PollerPool;

use super::options::SocketOptions;
use super::raw;
use super::recv_buffer::SocketRecvBuffer;
use super::sock_fd::{SockFd, SockNum, SockType};
use super::speed::BytesSpeed;

const DEFAULT_MAX_SEND_BUFFER_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_SEC: f32 = 5.0;

pub type OnReadCb = Box<dyn FnMut(Arc<dyn Buf>, Option<SocketAddr>) + Send>;
pub type OnErrCb = Box<dyn FnMut(SockError) + Send>;
pub type OnFlushCb = Box<dyn FnMut() -> bool + Send>;
pub type OnBeforeAcceptCb = Box<dyn FnMut(&Arc<EventPoller>) -> Option<Arc<Socket>> + Send>;
pub type OnAcceptCb = Box<dyn FnMut(Arc<Socket>, Arc<AcceptCompletion>) + Send>;
type ConnectCb = Arc<Mutex<dyn FnMut(Result<(), SockError>) + Send>>;

/// Deferred "the new peer socket is ready to attach its events" signal.
/// Grounded on the `shared_ptr<void> completed` trick in `Socket::onAccept`:
/// session setup can hold this (directly or through a clone) past its own
/// constructor, and the event registration only happens once the last
/// clone drops.
pub struct AcceptCompletion {
    sock: Arc<Socket>,
    num: Arc<SockNum>,
    fired: AtomicBool,
}

impl Drop for AcceptCompletion {
    fn drop(&mut self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.sock.attach_event(&self.num) {
            log::error!("add event to poller failed when accept a socket: {err}");
            self.sock.emit_err(SockError::Eof);
        }
    }
}

fn warn_no_read_cb(buf: &Arc<dyn Buf>) {
    log::warn!("socket has no read callback, {} bytes dropped", buf.len());
}

pub struct Socket {
    poller: Arc<EventPoller>,
    sock_fd: Mutex<Option<Arc<SockFd>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    udp_send_dst: Mutex<Option<SocketAddr>>,

    send_buf_waiting: Mutex<VecDeque<BufferSock>>,
    send_buf_sending: Mutex<VecDeque<Box<dyn BufferList>>>,

    sendable: AtomicBool,
    enable_recv: AtomicBool,
    enable_speed: AtomicBool,
    err_emit: AtomicBool,

    max_send_buffer_ms: AtomicU64,
    send_flush_since: Mutex<Instant>,

    con_timer: Mutex<Option<crate::poller::DelayTask>>,

    recv_speed: Mutex<BytesSpeed>,
    send_speed: Mutex<BytesSpeed>,

    options: Mutex<SocketOptions>,
    sock_flags: AtomicI32,

    on_read: Mutex<OnReadCb>,
    on_err: Mutex<OnErrCb>,
    on_accept: Mutex<OnAcceptCb>,
    on_flush: Mutex<OnFlushCb>,
    on_before_accept: Mutex<OnBeforeAcceptCb>,
    send_result: Mutex<Option<SendResultCb>>,
}

impl Socket {
    /// `poller = None` picks the least-loaded poller from the process-wide
    /// pool, matching `Socket::createSocket`.
    pub fn create(poller: Option<Arc<EventPoller>>) -> Arc<Socket> {
        let poller = poller.unwrap_or_else(|| PollerPool::instance().get_poller(true));
        Arc::new(Socket {
            poller,
            sock_fd: Mutex::new(None),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            udp_send_dst: Mutex::new(None),
            send_buf_waiting: Mutex::new(VecDeque::new()),
            send_buf_sending: Mutex::new(VecDeque::new()),
            sendable: AtomicBool::new(true),
            enable_recv: AtomicBool::new(true),
            enable_speed: AtomicBool::new(false),
            err_emit: AtomicBool::new(false),
            max_send_buffer_ms: AtomicU64::new(DEFAULT_MAX_SEND_BUFFER_MS),
            send_flush_since: Mutex::new(Instant::now()),
            con_timer: Mutex::new(None),
            recv_speed: Mutex::new(BytesSpeed::default()),
            send_speed: Mutex::new(BytesSpeed::default()),
            options: Mutex::new(SocketOptions::default()),
            sock_flags: AtomicI32::new(0),
            on_read: Mutex::new(Box::new(|buf, _addr| warn_no_read_cb(&buf))),
            on_err: Mutex::new(Box::new(|err| log::warn!("socket has no err callback, err: {err}"))),
            on_accept: Mutex::new(Box::new(|sock, _completed| {
                log::warn!("socket has no accept callback, peer fd: {}", sock.raw_fd());
            })),
            on_flush: Mutex::new(Box::new(|| true)),
            on_before_accept: Mutex::new(Box::new(|_poller| None)),
            send_result: Mutex::new(None),
        })
    }

    pub fn set_on_read(&self, cb: impl FnMut(Arc<dyn Buf>, Option<SocketAddr>) + Send + 'static) {
        *self.on_read.lock().unwrap() = Box::new(cb);
    }

    pub fn set_on_err(&self, cb: impl FnMut(SockError) + Send + 'static) {
        *self.on_err.lock().unwrap() = Box::new(cb);
    }

    pub fn set_on_accept(&self, cb: impl FnMut(Arc<Socket>, Arc<AcceptCompletion>) + Send + 'static) {
        *self.on_accept.lock().unwrap() = Box::new(cb);
    }

    pub fn set_on_flush(&self, cb: impl FnMut() -> bool + Send + 'static) {
        *self.on_flush.lock().unwrap() = Box::new(cb);
    }

    pub fn set_on_before_accept(&self, cb: impl FnMut(&Arc<EventPoller>) -> Option<Arc<Socket>> + Send + 'static) {
        *self.on_before_accept.lock().unwrap() = Box::new(cb);
    }

    pub fn set_on_send_result(&self, cb: Option<SendResultCb>) {
        *self.send_result.lock().unwrap() = cb;
    }

    pub fn set_options(&self, opts: SocketOptions) {
        *self.options.lock().unwrap() = opts;
    }

    // ---------------------------------------------------------------- connect

    /// Asynchronous connect: resolves `host` (off-thread if it isn't
    /// already a literal address), then completes on the poller thread.
    /// `con_cb` fires exactly once, success or failure.
    pub fn connect(
        self: &Arc<Self>,
        host: impl Into<String>,
        port: u16,
        con_cb: impl FnMut(Result<(), SockError>) + Send + 'static,
        timeout_sec: f32,
        local_ip: Option<SocketAddr>,
    ) {
        let this = Arc::clone(self);
        let host = host.into();
        let con_cb: ConnectCb = Arc::new(Mutex::new(con_cb));
        self.poller.async_task(move || {
            this.connect_l(host.clone(), port, Arc::clone(&con_cb), timeout_sec, local_ip);
        });
    }

    fn connect_l(
        self: &Arc<Self>,
        host: String,
        port: u16,
        user_cb: ConnectCb,
        timeout_sec: f32,
        local_ip: Option<SocketAddr>,
    ) {
        self.close_sock(true);
        let timeout_sec = if timeout_sec > 0.0 { timeout_sec } else { DEFAULT_CONNECT_TIMEOUT_SEC };

        // Wraps the caller's callback so it fires exactly once: cancels the
        // timeout timer and tears down a half-open fd on failure, no matter
        // which of the two paths below (timeout vs. the connect event) wins.
        let this = Arc::clone(self);
        let fired = Arc::new(AtomicBool::new(false));
        let con_cb: ConnectCb = Arc::new(Mutex::new(move |result: Result<(), SockError>| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(task) = this.con_timer.lock().unwrap().take() {
                task.cancel();
            }
            if result.is_err() {
                this.close_sock(true);
            }
            (user_cb.lock().unwrap())(result);
        }));

        let timer_cb = {
            let con_cb = Arc::clone(&con_cb);
            move || {
                (con_cb.lock().unwrap())(Err(SockError::Timeout));
                0
            }
        };
        *self.con_timer.lock().unwrap() = Some(
            self.poller
                .do_delay_task((timeout_sec * 1000.0) as u64, timer_cb),
        );

        if let Ok(addr) = host.parse::<std::net::IpAddr>() {
            let addr = SocketAddr::new(addr, port);
            self.start_connect(addr, local_ip, con_cb);
        } else {
            let poller = Arc::clone(&self.poller);
            let this = Arc::clone(self);
            let con_cb2 = Arc::clone(&con_cb);
            DnsPool::instance().resolve(host.clone(), port, Arc::clone(&poller), move |result| {
                match result {
                    Ok(addrs) if !addrs.is_empty() => this.start_connect(addrs[0], local_ip, con_cb2),
                    Ok(_) => (con_cb2.lock().unwrap())(Err(SockError::Dns(format!("no address for {host}")))),
                    Err(err) => (con_cb2.lock().unwrap())(Err(SockError::Dns(err.to_string()))),
                }
            });
        }
    }

    fn start_connect(self: &Arc<Self>, addr: SocketAddr, local_ip: Option<SocketAddr>, con_cb: ConnectCb) {
        let opts = self.options.lock().unwrap().clone();
        let fd = match raw::tcp_connect(addr, local_ip, &opts) {
            Ok(fd) => fd,
            Err(err) => {
                (con_cb.lock().unwrap())(Err(SockError::from_io(&err)));
                return;
            }
        };
        let num = SockNum::new(fd, SockType::Tcp);
        let this = Arc::clone(self);
        let num_for_cb = Arc::clone(&num);
        let con_cb2 = Arc::clone(&con_cb);
        let result = self.poller.add_event(
            fd,
            PollEvent::WRITE | PollEvent::ERROR,
            Arc::new(move |_event| {
                this.on_connected(&num_for_cb, &con_cb2);
            }),
        );
        match result {
            Ok(()) => self.set_sock(Some(num)),
            Err(err) => (con_cb.lock().unwrap())(Err(SockError::Other(format!(
                "add event to poller failed when start connect: {err}"
            )))),
        }
    }

    fn on_connected(self: &Arc<Self>, num: &Arc<SockNum>, con_cb: &ConnectCb) {
        if let Err(err) = raw::take_error(num.raw_fd()) {
            (con_cb.lock().unwrap())(Err(SockError::from_io(&err)));
            return;
        }
        self.set_sock(Some(Arc::clone(num)));
        let _ = self.poller.del_event(num.raw_fd(), None);
        if let Err(err) = self.attach_event(num) {
            (con_cb.lock().unwrap())(Err(SockError::Other(format!(
                "add event to poller failed when connected: {err}"
            ))));
            return;
        }
        (con_cb.lock().unwrap())(Ok(()));
    }

    /// Registers the fd with the poller per its type: listeners watch
    /// `READ|ERROR` and dispatch to `on_accept_fd`; everything else watches
    /// `READ|WRITE|ERROR` and dispatches to `on_read`/`on_write_able`.
    fn attach_event(self: &Arc<Self>, num: &Arc<SockNum>) -> std::io::Result<()> {
        let this = Arc::clone(self);
        let num_cb = Arc::clone(num);
        if num.sock_type() == SockType::TcpServer {
            return self.poller.add_event(
                num.raw_fd(),
                PollEvent::READ | PollEvent::ERROR,
                Arc::new(move |event| {
                    this.on_accept_fd(&num_cb, event);
                }),
            );
        }

        let read_buffer: Arc<SocketRecvBuffer> = self.poller.get_shared_buffer(num.sock_type() == SockType::Udp);
        self.poller.add_event(
            num.raw_fd(),
            PollEvent::READ | PollEvent::WRITE | PollEvent::ERROR,
            Arc::new(move |event| {
                if event.contains(PollEvent::READ) {
                    this.on_read(&num_cb, &read_buffer);
                }
                if event.contains(PollEvent::WRITE) {
                    this.on_write_able(&num_cb);
                }
                if event.contains(PollEvent::ERROR) && num_cb.sock_type() != SockType::Udp {
                    if let Err(err) = raw::take_error(num_cb.raw_fd()) {
                        this.emit_err(SockError::from_io(&err));
                    }
                }
            }),
        )
    }

    fn on_read(self: &Arc<Self>, num: &Arc<SockNum>, buffer: &Arc<SocketRecvBuffer>) {
        while self.enable_recv.load(Ordering::SeqCst) {
            match buffer.recv_from(num.raw_fd(), num.sock_type() == SockType::Udp) {
                Ok((bytes, _)) if bytes.is_empty() => {
                    if num.sock_type() != SockType::Udp {
                        self.emit_err(SockError::Eof);
                    } else {
                        log::warn!("recv eof on udp socket[{}]", num.raw_fd());
                    }
                    return;
                }
                Ok((bytes, addr)) => {
                    let n = bytes.len() as u64;
                    if self.enable_speed.load(Ordering::SeqCst) {
                        self.recv_speed.lock().unwrap().add(n);
                    }
                    let buf: Arc<dyn Buf> = Arc::new({
                        let mut raw = RawBuffer::with_capacity(bytes.len());
                        raw.assign(&bytes);
                        raw
                    });
                    (self.on_read.lock().unwrap())(buf, addr);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    if num.sock_type() != SockType::Udp {
                        self.emit_err(SockError::from_io(&err));
                    } else {
                        log::warn!("recv err on udp socket[{}]: {err}", num.raw_fd());
                    }
                    return;
                }
            }
        }
    }

    /// Fires `on_err` at most once per socket lifetime, matching
    /// `Socket::emitErr`'s `err_emit_` latch, and defers the actual close
    /// to the poller thread so a session tearing itself down inside the
    /// callback can still read fd-derived info (peer addr etc).
    pub(crate) fn emit_err(self: &Arc<Self>, err: SockError) {
        if self.err_emit.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        self.poller.async_task(move || {
            (this.on_err.lock().unwrap())(err.clone());
            this.close_sock(false);
        });
    }

    // ----------------------------------------------------------------- listen

    pub fn listen(self: &Arc<Self>, addr: SocketAddr, backlog: i32) -> bool {
        self.close_sock(true);
        match raw::tcp_listen(addr, backlog) {
            Ok(fd) => self.from_sock_l(SockNum::new(fd, SockType::TcpServer)),
            Err(err) => {
                log::warn!("listen failed: {err}");
                false
            }
        }
    }

    pub fn bind_udp_sock(self: &Arc<Self>, addr: SocketAddr, enable_reuse: bool) -> bool {
        self.close_sock(true);
        match raw::udp_bind(addr, enable_reuse) {
            Ok(fd) => self.from_sock_l(SockNum::new(fd, SockType::Udp)),
            Err(err) => {
                log::warn!("bind udp socket failed: {err}");
                false
            }
        }
    }

    /// Adopt an already-open fd (e.g. one pulled out of `std::net`),
    /// applying the same baseline `listen`/`connect` apply to fresh fds.
    pub fn from_fd(self: &Arc<Self>, fd: RawFd, ty: SockType) -> bool {
        self.close_sock(true);
        let opts = self.options.lock().unwrap().clone();
        if let Err(err) = super::options::apply(fd, &opts) {
            log::warn!("applying socket options failed: {err}");
        }
        self.from_sock_l(SockNum::new(fd, ty))
    }

    fn from_sock_l(self: &Arc<Self>, num: Arc<SockNum>) -> bool {
        if self.attach_event(&num).is_err() {
            return false;
        }
        self.set_sock(Some(num));
        true
    }

    /// Registers the same listening fd with another poller too, matching
    /// `Socket::cloneSocket` — used so one accept-capable fd can be
    /// watched by every poller in the pool.
    pub fn clone_socket(self: &Arc<Self>, other: &Socket) -> bool {
        self.close_sock(true);
        let num = match other.sock_fd.lock().unwrap().as_ref() {
            Some(fd) => fd.sock_num().clone(),
            None => {
                log::warn!("sockfd of src socket is null");
                return false;
            }
        };
        self.from_sock_l(num)
    }

    // ------------------------------------------------------------------- send

    pub fn send(self: &Arc<Self>, buf: Arc<dyn Buf>, try_flush: bool) -> isize {
        if buf.is_empty() {
            return 0;
        }
        let dest = *self.udp_send_dst.lock().unwrap();
        self.send_l(BufferSock::new(buf, dest), try_flush)
    }

    pub fn send_to(self: &Arc<Self>, buf: Arc<dyn Buf>, dest: SocketAddr, try_flush: bool) -> isize {
        if buf.is_empty() {
            return 0;
        }
        self.send_l(BufferSock::new(buf, Some(dest)), try_flush)
    }

    fn send_l(self: &Arc<Self>, buf: BufferSock, try_flush: bool) -> isize {
        let size = buf.len() as isize;
        self.send_buf_waiting.lock().unwrap().push_back(buf);
        if try_flush && self.flush_all() != 0 {
            return -1;
        }
        size
    }

    /// Returns `0` on success/no-op, `-1` if the socket is gone or has
    /// timed out waiting for the kernel to drain, matching `flushAll`.
    pub fn flush_all(self: &Arc<Self>) -> i32 {
        let num = match self.sock_fd.lock().unwrap().as_ref() {
            Some(fd) => fd.sock_num().clone(),
            None => return -1,
        };
        if self.sendable.load(Ordering::SeqCst) {
            return if self.flush_data(&num, false) { 0 } else { -1 };
        }
        let elapsed = self.send_flush_since.lock().unwrap().elapsed();
        if elapsed > Duration::from_millis(self.max_send_buffer_ms.load(Ordering::SeqCst)) {
            self.emit_err(SockError::Timeout);
            return -1;
        }
        0
    }

    fn on_flushed(self: &Arc<Self>) {
        let keep = (self.on_flush.lock().unwrap())();
        if !keep {
            *self.on_flush.lock().unwrap() = Box::new(|| true);
        }
    }

    /// Drains `send_buf_sending`, first promoting `send_buf_waiting` into
    /// a fresh `BufferList` batch if the sending queue has run dry.
    /// `poller_thread` selects between "try again synchronously" (called
    /// from the event loop) and "arm the writable-event and wait"
    /// (called from another thread via `send`).
    fn flush_data(self: &Arc<Self>, num: &Arc<SockNum>, poller_thread: bool) -> bool {
        let mut batch: VecDeque<Box<dyn BufferList>> = {
            let mut sending = self.send_buf_sending.lock().unwrap();
            std::mem::take(&mut *sending)
        };

        if batch.is_empty() {
            *self.send_flush_since.lock().unwrap() = Instant::now();
            let mut waiting = self.send_buf_waiting.lock().unwrap();
            if waiting.is_empty() {
                drop(waiting);
                if poller_thread {
                    self.stop_write_able_event(num);
                    self.on_flushed();
                }
                return true;
            }
            let promoted = std::mem::take(&mut *waiting);
            drop(waiting);
            batch.push_back(buffer_list::build_for(num.sock_type() == SockType::Udp, promoted));
        }

        // Wraps the caller's send-result callback (if any) so a completed
        // buffer's length is folded into the send-speed counter first.
        let this = Arc::clone(self);
        let enable_speed = self.enable_speed.load(Ordering::SeqCst);
        let user_cb = self.send_result.lock().unwrap().clone();
        let result_cb: SendResultCb = Arc::new(move |buf, ok| {
            if ok && enable_speed {
                this.send_speed.lock().unwrap().add(buf.len() as u64);
            }
            if let Some(cb) = &user_cb {
                cb(buf, ok);
            }
        });

        while let Some(packet) = batch.front_mut() {
            match packet.send(num.raw_fd(), Some(&result_cb)) {
                Ok(true) => {
                    batch.pop_front();
                    continue;
                }
                Ok(false) => {
                    if !poller_thread {
                        self.start_write_able_event(num);
                    }
                    break;
                }
                Err(err) => {
                    if num.sock_type() == SockType::Udp {
                        batch.pop_front();
                        log::warn!("send udp socket[{}] failed, data ignored: {err}", num.raw_fd());
                        continue;
                    }
                    self.emit_err(SockError::from_io(&err));
                    return false;
                }
            }
        }

        if !batch.is_empty() {
            let mut sending = self.send_buf_sending.lock().unwrap();
            for item in batch.into_iter().rev() {
                sending.push_front(item);
            }
            return true;
        }

        if poller_thread {
            self.flush_data(num, poller_thread)
        } else {
            true
        }
    }

    fn start_write_able_event(self: &Arc<Self>, num: &Arc<SockNum>) {
        self.sendable.store(false, Ordering::SeqCst);
        let read = if self.enable_recv.load(Ordering::SeqCst) { PollEvent::READ } else { PollEvent::NONE };
        let _ = self.poller.modify_event(num.raw_fd(), read | PollEvent::ERROR | PollEvent::WRITE, None);
    }

    fn stop_write_able_event(self: &Arc<Self>, num: &Arc<SockNum>) {
        self.sendable.store(true, Ordering::SeqCst);
        let read = if self.enable_recv.load(Ordering::SeqCst) { PollEvent::READ } else { PollEvent::NONE };
        let _ = self.poller.modify_event(num.raw_fd(), read | PollEvent::ERROR, None);
    }

    fn on_write_able(self: &Arc<Self>, num: &Arc<SockNum>) {
        let empty_waiting = self.send_buf_waiting.lock().unwrap().is_empty();
        let empty_sending = self.send_buf_sending.lock().unwrap().is_empty();
        if empty_waiting && empty_sending {
            self.stop_write_able_event(num);
        } else {
            self.flush_data(num, true);
        }
    }

    // --------------------------------------------------------------- accept

    fn on_accept_fd(self: &Arc<Self>, listener: &Arc<SockNum>, event: PollEvent) {
        if event.contains(PollEvent::ERROR) {
            let err = raw::take_error(listener.raw_fd()).err();
            let ex = err.map(|e| SockError::from_io(&e)).unwrap_or(SockError::Other("listener error".into()));
            log::error!("tcp listener occurred an err: {ex}");
            self.emit_err(ex);
            return;
        }
        if !event.contains(PollEvent::READ) {
            return;
        }
        loop {
            let (fd, _peer) = match raw::accept(listener.raw_fd()) {
                Ok(pair) => pair,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::error!("accept socket failed: {err}");
                    // edge-triggered accept needs a manual re-trigger once fds free up.
                    let this = Arc::clone(self);
                    let listener = Arc::clone(listener);
                    self.poller.do_delay_task(100, move || {
                        this.on_accept_fd(&listener, PollEvent::READ);
                        0
                    });
                    return;
                }
            };

            let opts = self.options.lock().unwrap().clone();
            if let Err(err) = super::options::apply(fd, &opts) {
                log::warn!("applying accepted socket options failed: {err}");
            }

            let peer_sock = (self.on_before_accept.lock().unwrap())(&self.poller)
                .unwrap_or_else(|| Socket::create(Some(Arc::clone(&self.poller))));

            let num = SockNum::new(fd, SockType::Tcp);
            peer_sock.set_sock(Some(Arc::clone(&num)));

            let completion = Arc::new(AcceptCompletion {
                sock: Arc::clone(&peer_sock),
                num,
                fired: AtomicBool::new(false),
            });
            (self.on_accept.lock().unwrap())(peer_sock, completion);
        }
    }

    // ----------------------------------------------------------------- state

    fn set_sock(self: &Arc<Self>, num: Option<Arc<SockNum>>) {
        let mut slot = self.sock_fd.lock().unwrap();
        match num {
            Some(num) => {
                let fd = num.raw_fd();
                *slot = Some(SockFd::new(num, Arc::clone(&self.poller)));
                *self.local_addr.lock().unwrap() = raw::local_addr(fd).ok();
                *self.peer_addr.lock().unwrap() = raw::peer_addr(fd).ok();
            }
            None => *slot = None,
        }
    }

    /// Resets to the empty state. `close_fd = false` only removes the
    /// event registration (keeps the fd alive a moment longer), matching
    /// `closeSock(false)`'s use from `emitErr` so session teardown can
    /// still read peer info off the now-unregistered fd.
    fn close_sock(self: &Arc<Self>, close_fd: bool) {
        self.sendable.store(true, Ordering::SeqCst);
        self.enable_recv.store(true, Ordering::SeqCst);
        self.enable_speed.store(false, Ordering::SeqCst);
        *self.con_timer.lock().unwrap() = None;
        *self.send_flush_since.lock().unwrap() = Instant::now();
        self.send_buf_waiting.lock().unwrap().clear();
        self.send_buf_sending.lock().unwrap().clear();

        let mut slot = self.sock_fd.lock().unwrap();
        if close_fd {
            self.err_emit.store(false, Ordering::SeqCst);
            *slot = None;
        } else if let Some(fd) = slot.as_ref() {
            fd.del_event();
        }
    }

    pub fn get_send_buffer_count(&self) -> usize {
        let waiting = self.send_buf_waiting.lock().unwrap().len();
        let sending: usize = self.send_buf_sending.lock().unwrap().iter().map(|b| b.count()).sum();
        waiting + sending
    }

    pub fn elapsed_time_after_flushed(&self) -> u128 {
        self.send_flush_since.lock().unwrap().elapsed().as_millis()
    }

    pub fn get_recv_speed(&self) -> u64 {
        self.enable_speed.store(true, Ordering::SeqCst);
        self.recv_speed.lock().unwrap().speed()
    }

    pub fn get_send_speed(&self) -> u64 {
        self.enable_speed.store(true, Ordering::SeqCst);
        self.send_speed.lock().unwrap().speed()
    }

    pub fn get_local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn get_peer_addr(&self) -> Option<SocketAddr> {
        if let Some(dst) = *self.udp_send_dst.lock().unwrap() {
            return Some(dst);
        }
        *self.peer_addr.lock().unwrap()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.sock_fd.lock().unwrap().as_ref().map_or(-1, |fd| fd.raw_fd())
    }

    pub fn alive(&self) -> bool {
        self.sock_fd.lock().unwrap().is_some() && !self.err_emit.load(Ordering::SeqCst)
    }

    pub fn sock_type(&self) -> Option<SockType> {
        self.sock_fd.lock().unwrap().as_ref().map(|fd| fd.sock_type())
    }

    pub fn set_send_timeout_ms(&self, ms: u64) {
        self.max_send_buffer_ms.store(ms, Ordering::SeqCst);
    }

    pub fn is_socket_busy(&self) -> bool {
        !self.sendable.load(Ordering::SeqCst)
    }

    pub fn poller(&self) -> &Arc<EventPoller> {
        &self.poller
    }

    pub fn enable_recv(&self, enabled: bool) {
        if self.enable_recv.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        let Some(num) = self.sock_fd.lock().unwrap().as_ref().map(|fd| fd.sock_num().clone()) else {
            return;
        };
        let read_flag = if enabled { PollEvent::READ } else { PollEvent::NONE };
        let write_flag = if self.sendable.load(Ordering::SeqCst) { PollEvent::NONE } else { PollEvent::WRITE };
        let _ = self.poller.modify_event(num.raw_fd(), read_flag | write_flag | PollEvent::ERROR, None);
    }

    /// `soft_bind` only remembers `dst` for `send`'s default destination;
    /// the hard path additionally `connect()`s the UDP socket so the
    /// kernel filters unrelated peers, matching `bindPeerAddr`.
    pub fn bind_peer_addr(&self, dst: SocketAddr, soft_bind: bool) -> bool {
        let num = match self.sock_fd.lock().unwrap().as_ref() {
            Some(fd) if fd.sock_type() == SockType::Udp => fd.sock_num().clone(),
            _ => return false,
        };
        if soft_bind {
            *self.udp_send_dst.lock().unwrap() = Some(dst);
        } else {
            *self.udp_send_dst.lock().unwrap() = None;
            if let Err(err) = raw::connect_peer(num.raw_fd(), dst) {
                log::warn!("connect socket to peer address failed: {dst}: {err}");
                return false;
            }
            *self.peer_addr.lock().unwrap() = Some(dst);
        }
        true
    }

    pub fn set_send_flags(&self, flags: i32) {
        self.sock_flags.store(flags, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    fn running_poller(name: &str) -> Arc<EventPoller> {
        let poller = EventPoller::new(name).unwrap();
        poller.run(false, true).unwrap();
        poller
    }

    /// Invariant 2: at most one `on_err` is delivered over a socket's
    /// lifetime, even if something tries to emit a second one.
    #[test]
    fn emit_err_fires_at_most_once() {
        let poller = running_poller("socket-test-emit-err");
        let sock = Socket::create(Some(poller));
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(sock.from_fd(a.into_raw_fd(), SockType::Tcp));

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        sock.set_on_err(move |_err| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        sock.emit_err(SockError::Eof);
        sock.emit_err(SockError::Other("second emit".into()));

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// Invariant 7: a buffer handed to `send` that goes through gets exactly
    /// one `on_send_result(_, true)` callback.
    #[test]
    fn send_result_delivered_exactly_once() {
        let poller = running_poller("socket-test-send-result");
        let sock = Socket::create(Some(poller));
        let (a, mut b) = UnixStream::pair().unwrap();
        assert!(sock.from_fd(a.into_raw_fd(), SockType::Tcp));

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        sock.set_on_send_result(Some(Arc::new(move |_buf, ok| {
            if ok {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        })));

        let payload: Arc<dyn Buf> = Arc::new(RawBuffer::from_bytes(b"hello".to_vec()));
        sock.send(payload, true);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // drain the peer side so the stream doesn't linger with unread data.
        let mut scratch = [0u8; 16];
        use std::io::Read;
        let _ = b.read(&mut scratch);
    }
}
