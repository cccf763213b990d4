//! Connection type handed to the pooled HTTP client.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the dialer can produce.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// An established outbound stream (plain, tunnelled, SOCKS or TLS).
///
/// `proxied` marks a plain-HTTP forward-proxy connection, which makes the
/// client send absolute-form request targets.
pub struct OutboundConn {
    io: TokioIo<BoxedIo>,
    proxied: bool,
}

impl OutboundConn {
    pub fn new(io: BoxedIo, proxied: bool) -> Self {
        Self { io: TokioIo::new(io), proxied }
    }

    pub fn is_proxied(&self) -> bool {
        self.proxied
    }
}

impl std::fmt::Debug for OutboundConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConn").field("proxied", &self.proxied).finish()
    }
}

impl Connection for OutboundConn {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.proxied)
    }
}

impl Read for OutboundConn {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: ReadBufCursor<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl Write for OutboundConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
