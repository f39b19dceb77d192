//! TLS box seam: the encode/decode boundary a session wraps around its
//! underlying socket. Grounded on `SSLBox` in
//! `original_source/src/network/SSLbox.h`/`SSLbox.cc`, stripped of the
//! OpenSSL plumbing (`BIO`/`SSL_CTX`/certificate loading) that's out of
//! scope here — this crate only needs the trait seam a real TLS crate
//! (`rustls`, `openssl`) implements, not a TLS stack of its own.

use std::io;
use std::sync::Arc;

use crate::buffer::Buf;

/// Encrypt-on-send / decrypt-on-receive boundary a session can sit behind.
/// `on_enc_data` wraps a plaintext buffer for the wire (`SSLBox::onSend`);
/// `on_dec_data` unwraps wire bytes back to plaintext (`SSLBox::onRecv`).
/// Both take `&mut self` because a real handshake-driven implementation
/// needs to buffer partial records between calls, matching `SSLBox`'s own
/// `read_bio_`/`write_bio_` state.
pub trait TlsBox: Send {
    fn on_enc_data(&mut self, buf: Arc<dyn Buf>) -> io::Result<Arc<dyn Buf>>;
    fn on_dec_data(&mut self, buf: Arc<dyn Buf>) -> io::Result<Arc<dyn Buf>>;
}

/// Identity `TlsBox`: passes buffers through unchanged. Exists so a
/// session can be generic over `TlsBox` without every caller needing a
/// real certificate-backed implementation on hand, and doubles as the
/// fixture plaintext connections in tests run through.
#[derive(Default)]
pub struct PassthroughTlsBox;

impl TlsBox for PassthroughTlsBox {
    fn on_enc_data(&mut self, buf: Arc<dyn Buf>) -> io::Result<Arc<dyn Buf>> {
        Ok(buf)
    }

    fn on_dec_data(&mut self, buf: Arc<dyn Buf>) -> io::Result<Arc<dyn Buf>> {
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RawBuffer;

    #[test]
    fn passthrough_round_trips_unchanged() {
        let mut tls = PassthroughTlsBox;
        let mut raw = RawBuffer::with_capacity(8);
        raw.assign(b"hello");
        let buf: Arc<dyn Buf> = Arc::new(raw);
        let enc = tls.on_enc_data(buf.clone()).unwrap();
        assert_eq!(enc.data(), buf.data());
        let dec = tls.on_dec_data(enc).unwrap();
        assert_eq!(dec.data(), b"hello");
    }
}
