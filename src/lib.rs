//! A single-process, multi-threaded event-driven runtime for TCP/UDP
//! servers and clients: an `epoll`/`kqueue` reactor (`poller`), a
//! non-blocking `Socket` state machine built on top of it, and the
//! `Session`/`TcpServer`/`UdpServer` layer applications actually drive.
//!
//! Logging goes through the [`log`] crate's global logger; this crate
//! never installs one itself, so a binary wires in `env_logger`,
//! `tracing-log`, or whatever else fits. The only Unix targets are
//! `epoll` (Linux) and `kqueue` (BSD/macOS) — Windows is out of scope,
//! matching the `#[cfg(unix)]` boundary this crate is built around.

#![cfg(unix)]

pub mod buffer;
pub mod buffer_list;
pub mod buffer_sock;
pub mod error;
pub mod net;
pub mod poller;
pub mod session;
pub mod socket;
pub mod tls;
pub mod util;

pub use buffer::{Buf, OffsetBuffer, RawBuffer, StringBuffer};
pub use buffer_list::{BufferList, SendResultCb};
pub use buffer_sock::BufferSock;
pub use error::{PollErrorCode, PollerError, SockError};
pub use net::{make_peer_id, PeerId, TcpServer, UdpServer};
pub use poller::{EventPoller, PollEvent};
pub use session::{ServerConfig, Session, SessionWithTls, SocketHelper};
pub use socket::{AcceptCompletion, Socket, SocketOptions};
pub use tls::{PassthroughTlsBox, TlsBox};
