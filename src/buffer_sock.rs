//! `Buffer` + optional destination sockaddr, for addressed UDP sends.
//!
//! Grounded on `ZLToolKit/src/Network/BufferSock.h`.

use crate::buffer::Buf;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct BufferSock {
    pub buf: Arc<dyn Buf>,
    pub dest: Option<SocketAddr>,
}

impl BufferSock {
    pub fn new(buf: Arc<dyn Buf>, dest: Option<SocketAddr>) -> Self {
        BufferSock { buf, dest }
    }

    pub fn unaddressed(buf: Arc<dyn Buf>) -> Self {
        BufferSock { buf, dest: None }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
