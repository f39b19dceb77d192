//! Server-level plumbing built on top of [`crate::socket`] and
//! [`crate::session`]: the listening TCP/UDP servers applications start.

pub mod tcp_server;
pub mod udp_server;

pub use tcp_server::TcpServer;
pub use udp_server::{make_peer_id, PeerId, UdpServer};
