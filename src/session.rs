//! The per-connection facade servers hand to user code.
//!
//! `SocketHelper` bundles the poller/socket/flush-flag/create-socket-hook
//! state every session needs; `Session` adds config attachment and a
//! lazily-computed identifier. Grounded on `SocketHelper` (the tail end of
//! `original_source/src/network/socket.cc`) and on `Session`/`TcpSession`/
//! `UdpSession` in `original_source/src/network/session.h` / `session.cc`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::Buf;
use crate::error::SockError;
use crate::poller::EventPoller;
use crate::socket::{SockType, Socket};
use crate::tls::TlsBox;
use crate::util::{Counted, ObjectCounter};

/// INI-style key/value config container attached to every session.
/// `spec.md` keeps the INI parser itself out of scope; a real
/// implementation (an INI crate) only needs to satisfy this trait.
pub trait ServerConfig: Send + Sync {
    fn get(&self, key: &str) -> Option<&str>;
}

type OnCreateSocketCb = Box<dyn Fn(&Arc<EventPoller>) -> Arc<Socket> + Send + Sync>;

/// Socket-adjacent bookkeeping shared by every concrete session type:
/// poller/socket handles, the send-flush default, and the factory hook a
/// `TcpServer` overrides to hand out pre-configured sockets to new
/// connections. Grounded one-for-one on `SocketHelper` in `socket.cc`.
pub struct SocketHelper {
    poller: Mutex<Arc<EventPoller>>,
    sock: Mutex<Arc<Socket>>,
    try_flush: AtomicBool,
    on_create_socket: Mutex<Option<OnCreateSocketCb>>,
}

impl SocketHelper {
    pub fn new(sock: Arc<Socket>) -> SocketHelper {
        let poller = sock.poller().clone();
        SocketHelper {
            poller: Mutex::new(poller),
            sock: Mutex::new(sock),
            try_flush: AtomicBool::new(true),
            on_create_socket: Mutex::new(None),
        }
    }

    pub fn poller(&self) -> Arc<EventPoller> {
        self.poller.lock().unwrap().clone()
    }

    pub fn set_send_flush_flag(&self, try_flush: bool) {
        self.try_flush.store(try_flush, Ordering::SeqCst);
    }

    pub fn set_send_flags(&self, flags: i32) {
        self.sock.lock().unwrap().set_send_flags(flags);
    }

    pub fn is_socket_busy(&self) -> bool {
        self.sock.lock().unwrap().is_socket_busy()
    }

    /// Overrides the default `Socket::create` factory a `TcpServer` uses
    /// when handing a fresh peer socket to this session, matching
    /// `setOnCreateSocket`.
    pub fn set_on_create_socket(
        &self,
        cb: impl Fn(&Arc<EventPoller>) -> Arc<Socket> + Send + Sync + 'static,
    ) {
        *self.on_create_socket.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn create_socket(&self, poller: &Arc<EventPoller>) -> Arc<Socket> {
        match self.on_create_socket.lock().unwrap().as_ref() {
            Some(cb) => cb(poller),
            None => Socket::create(Some(poller.clone())),
        }
    }

    pub fn get_sock(&self) -> Arc<Socket> {
        self.sock.lock().unwrap().clone()
    }

    pub fn flush_all(&self) -> i32 {
        self.sock.lock().unwrap().flush_all()
    }

    /// `false` here; `SessionWithTls` overrides this by wrapping the whole
    /// session rather than overriding a method, since Rust has no virtual
    /// dispatch to hook into.
    pub fn over_tls(&self) -> bool {
        false
    }

    pub fn get_local_addr(&self) -> Option<SocketAddr> {
        self.sock.lock().unwrap().get_local_addr()
    }

    pub fn get_peer_addr(&self) -> Option<SocketAddr> {
        self.sock.lock().unwrap().get_peer_addr()
    }

    pub fn send(&self, buf: Arc<dyn Buf>) -> isize {
        let try_flush = self.try_flush.load(Ordering::SeqCst);
        self.sock.lock().unwrap().send(buf, try_flush)
    }

    pub fn set_poller(&self, poller: Arc<EventPoller>) {
        *self.poller.lock().unwrap() = poller;
    }

    pub fn set_sock(&self, sock: Arc<Socket>) {
        *self.poller.lock().unwrap() = sock.poller().clone();
        *self.sock.lock().unwrap() = sock;
    }
}

struct TcpSessionKind;
impl Counted for TcpSessionKind {
    fn counter() -> &'static std::sync::atomic::AtomicUsize {
        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        &COUNTER
    }
}

struct UdpSessionKind;
impl Counted for UdpSessionKind {
    fn counter() -> &'static std::sync::atomic::AtomicUsize {
        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        &COUNTER
    }
}

enum SessionCounter {
    Tcp(ObjectCounter<TcpSessionKind>),
    Udp(ObjectCounter<UdpSessionKind>),
}

static SESSION_INDEX: AtomicI32 = AtomicI32::new(0);

/// A live connection. Wraps a [`SocketHelper`], picks up a live-instance
/// counter matching the accepted socket's type, and lazily computes a
/// stable per-process identifier on first use, matching
/// `Session::getIdentifier`.
pub struct Session {
    helper: SocketHelper,
    _counter: SessionCounter,
    id: Mutex<Option<String>>,
}

impl Session {
    pub fn new(sock: Arc<Socket>) -> Session {
        let counter = match sock.sock_type() {
            Some(SockType::Udp) => SessionCounter::Udp(ObjectCounter::new()),
            _ => SessionCounter::Tcp(ObjectCounter::new()),
        };
        Session {
            helper: SocketHelper::new(sock),
            _counter: counter,
            id: Mutex::new(None),
        }
    }

    pub fn helper(&self) -> &SocketHelper {
        &self.helper
    }

    /// Hook a `TcpServer`/`UdpServer` calls right after construction so
    /// the session can stash whatever server-side state it needs
    /// (config, parent handle, ...). Default no-op, matching
    /// `Session::attachServer`'s default virtual body.
    pub fn attach_server(&self, _config: &dyn ServerConfig) {}

    /// `"<monotonic index>-<raw fd>"`, computed once and cached, matching
    /// `Session::getIdentifier`'s `s_session_index` + rawFd concatenation.
    pub fn get_identifier(&self) -> String {
        let mut id = self.id.lock().unwrap();
        if id.is_none() {
            let index = SESSION_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
            *id = Some(format!("{}-{}", index, self.helper.get_sock().raw_fd()));
        }
        id.clone().unwrap()
    }

    /// Posts an immediate error to the underlying socket, tearing the
    /// connection down on the poller thread. Matches
    /// `SocketHelper::shutdown`.
    pub fn shutdown(&self, err: SockError) {
        self.helper.get_sock().emit_err(err);
    }

    /// Schedules [`shutdown`] from any thread, guarding against the
    /// session already having been torn down by the time the posted task
    /// runs. The original guards this with a `weak_ptr<SocketHelper>`
    /// upgrade; here the caller supplies its own `Weak<Session>` since a
    /// bare `&Session` has no way to produce one itself.
    pub fn safe_shutdown(self_weak: Weak<Session>, err: SockError) {
        let poller = match self_weak.upgrade() {
            Some(session) => session.helper.poller(),
            None => return,
        };
        poller.async_first(move || {
            if let Some(session) = self_weak.upgrade() {
                session.shutdown(err.clone());
            }
        });
    }
}

type OnDecodedCb = Box<dyn FnMut(Arc<dyn Buf>, Option<SocketAddr>) + Send>;

/// Composes a [`Session`] with a [`TlsBox`], wiring the socket's raw
/// `on_read` to decrypt before handing plaintext onward and routing
/// outgoing `send` calls through encryption first. Grounded on the
/// `SessionWithSSL<SessionType>` template in `session.h`: that template
/// wires `ssl_box_`'s encode/decode callbacks to the wrapped session's own
/// `send`/`onRecv`; here the wrapped session has no virtual `onRecv` to
/// hook (plaintext delivery is the caller's own `Socket::on_read`
/// callback), so the decode side is exposed as [`set_on_decoded`] instead.
pub struct SessionWithTls<T: TlsBox> {
    session: Session,
    tls: Mutex<T>,
    on_decoded: Mutex<OnDecodedCb>,
}

impl<T: TlsBox + 'static> SessionWithTls<T> {
    pub fn new(sock: Arc<Socket>, tls: T) -> Arc<SessionWithTls<T>> {
        let wrapper = Arc::new(SessionWithTls {
            session: Session::new(sock),
            tls: Mutex::new(tls),
            on_decoded: Mutex::new(Box::new(|_, _| {
                log::warn!("SessionWithTls: no on_decoded callback set, dropping decrypted data");
            })),
        });
        let weak = Arc::downgrade(&wrapper);
        wrapper.session.helper().get_sock().set_on_read(move |buf, addr| {
            let Some(wrapper) = weak.upgrade() else {
                return;
            };
            match wrapper.tls.lock().unwrap().on_dec_data(buf) {
                Ok(plain) => (wrapper.on_decoded.lock().unwrap())(plain, addr),
                Err(err) => log::warn!("tls decode failed: {err}"),
            }
        });
        wrapper
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn set_on_decoded(&self, cb: impl FnMut(Arc<dyn Buf>, Option<SocketAddr>) + Send + 'static) {
        *self.on_decoded.lock().unwrap() = Box::new(cb);
    }

    /// `true`, unlike [`SocketHelper::over_tls`]'s default — matches
    /// `SessionWithSSL::overSsl` always returning `true`.
    pub fn over_tls(&self) -> bool {
        true
    }

    /// Encrypts before handing off to the wrapped session's socket,
    /// matching `SessionWithSSL::send`'s `ssl_box_.onSend(...)` detour.
    /// Returns the plaintext length on success, matching the original's
    /// "report the caller's own buffer size regardless of ciphertext
    /// expansion" contract.
    pub fn send(&self, buf: Arc<dyn Buf>) -> isize {
        let plain_len = buf.len() as isize;
        match self.tls.lock().unwrap().on_enc_data(buf) {
            Ok(enc) => {
                self.session.helper().send(enc);
                plain_len
            }
            Err(err) => {
                log::warn!("tls encode failed: {err}");
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapConfig(std::collections::HashMap<String, String>);
    impl ServerConfig for MapConfig {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).map(|s| s.as_str())
        }
    }

    #[test]
    fn identifier_is_cached_and_stable() {
        let poller = EventPoller::new("session-test").unwrap();
        let sock = Socket::create(Some(poller));
        let session = Session::new(sock);
        let first = session.get_identifier();
        let second = session.get_identifier();
        assert_eq!(first, second);
    }

    #[test]
    fn session_counts_scoped_to_socket_type() {
        let poller = EventPoller::new("session-test").unwrap();
        let before = ObjectCounter::<TcpSessionKind>::count();
        let sock = Socket::create(Some(poller));
        let session = Session::new(sock);
        assert_eq!(ObjectCounter::<TcpSessionKind>::count(), before + 1);
        drop(session);
        assert_eq!(ObjectCounter::<TcpSessionKind>::count(), before);
    }

    #[test]
    fn attach_server_default_is_a_no_op() {
        let poller = EventPoller::new("session-test").unwrap();
        let sock = Socket::create(Some(poller));
        let session = Session::new(sock);
        let config = MapConfig(std::collections::HashMap::new());
        session.attach_server(&config);
    }

    #[test]
    fn tls_wrapper_reports_over_tls() {
        use crate::tls::PassthroughTlsBox;

        let poller = EventPoller::new("session-test").unwrap();
        let sock = Socket::create(Some(poller));
        let wrapper = SessionWithTls::new(sock, PassthroughTlsBox);
        assert!(wrapper.over_tls());
        assert!(!wrapper.session().helper().over_tls());
    }
}
