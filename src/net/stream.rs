//! Accepted connection streams.
//!
//! Every transport ends up as a `ClientStream`: a byte stream (TCP, TLS over
//! TCP, Unix socket) or a WebSocket carrying MQTT in binary frames.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::WebSocketStream;

/// Remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => write!(f, "unix"),
        }
    }
}

/// A raw byte stream, TLS-terminated when the listener carries a context.
pub enum ByteStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl ByteStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ByteStream::Tls(_))
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteStream::Tcp(_) => f.write_str("ByteStream::Tcp"),
            ByteStream::Tls(_) => f.write_str("ByteStream::Tls"),
            ByteStream::Unix(_) => f.write_str("ByteStream::Unix"),
        }
    }
}

impl AsyncRead for ByteStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ByteStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ByteStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ByteStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ByteStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ByteStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ByteStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ByteStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ByteStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ByteStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// What the routing core receives.
pub enum ClientStream {
    Stream(ByteStream),
    WebSocket(Box<WebSocketStream<ByteStream>>),
}

impl ClientStream {
    pub fn is_websocket(&self) -> bool {
        matches!(self, ClientStream::WebSocket(_))
    }

    pub fn is_tls(&self) -> bool {
        match self {
            ClientStream::Stream(s) => s.is_tls(),
            ClientStream::WebSocket(ws) => ws.get_ref().is_tls(),
        }
    }
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStream::Stream(s) => f.debug_tuple("ClientStream::Stream").field(s).finish(),
            ClientStream::WebSocket(ws) => f
                .debug_tuple("ClientStream::WebSocket")
                .field(ws.get_ref())
                .finish(),
        }
    }
}
