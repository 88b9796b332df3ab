//! Transport binder.
//!
//! # Responsibilities
//! - Turn a `ListenerConfig` into open, listening sockets
//! - Classify OS bind failures
//! - Finish per-connection transport handshakes (WebSocket upgrade)
//!
//! # Design Decisions
//! - Sockets are built with socket2 so reuse-address, `IPV6_V6ONLY` and
//!   interface binding are set before `bind`
//! - A host-less listener binds both wildcard families; a missing IPv6 stack
//!   is tolerated
//! - TLS termination is orthogonal and happens in the accept path

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};

use crate::config::{ListenerConfig, Protocol};
use crate::net::stream::{ByteStream, ClientStream, PeerAddr};
use crate::net::tls::TlsError;
use crate::net::websocket;

const LISTEN_BACKLOG: i32 = 1024;

/// Why a listener could not be bound.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("address {addr} already in use")]
    AddressInUse {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("permission denied binding {addr}")]
    PermissionDenied {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS material: {0}")]
    InvalidCert(#[from] TlsError),

    #[error("unsupported transport: {0}")]
    UnsupportedProtocol(String),

    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    fn classify(addr: impl Into<String>, source: io::Error) -> Self {
        let addr = addr.into();
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse { addr, source },
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied { addr, source },
            _ => BindError::Io { addr, source },
        }
    }

    /// Address family not present on this host.
    fn is_family_unavailable(&self) -> bool {
        match self {
            BindError::Io { source, .. } => {
                source.kind() == io::ErrorKind::AddrNotAvailable
                    || source.raw_os_error() == Some(libc::EAFNOSUPPORT)
            }
            _ => false,
        }
    }
}

/// Failure while finishing a connection's handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("WebSocket upgrade failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("client identity rejected")]
    Rejected,

    #[error("unsupported transport")]
    Unsupported,
}

impl HandshakeError {
    /// Metric label for the rejection.
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::Rejected => "identity",
            HandshakeError::Timeout => "timeout",
            _ => "handshake",
        }
    }
}

/// An open listening socket.
#[derive(Debug)]
pub enum ListenSocket {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl ListenSocket {
    pub async fn accept(&self) -> io::Result<(ByteStream, PeerAddr)> {
        match self {
            ListenSocket::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((ByteStream::Tcp(stream), PeerAddr::Inet(addr)))
            }
            ListenSocket::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((ByteStream::Unix(stream), PeerAddr::Unix))
            }
        }
    }

    /// Bound address, for logs and status.
    pub fn describe(&self) -> String {
        match self {
            ListenSocket::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            ListenSocket::Unix { path, .. } => format!("unix:{}", path.display()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenSocket::Tcp(listener) => listener.local_addr().ok(),
            ListenSocket::Unix { .. } => None,
        }
    }

    /// Socket file to unlink once the socket is closed.
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            ListenSocket::Tcp(_) => None,
            ListenSocket::Unix { path, .. } => Some(path),
        }
    }
}

/// Transport variant a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Mqtt,
    MqttSn,
    WebSockets,
    Unix,
    /// WebSocket upgrade served on a unix domain socket.
    UnixWebSockets,
}

impl Transport {
    /// Protocol decides first; the endpoint only picks the socket family.
    pub fn for_config(config: &ListenerConfig) -> Self {
        let unix = config.unix_socket_path.is_some();
        match (config.protocol, unix) {
            (Protocol::MqttSn, _) => Transport::MqttSn,
            (Protocol::Mqtt, false) => Transport::Mqtt,
            (Protocol::Mqtt, true) => Transport::Unix,
            (Protocol::Websockets, false) => Transport::WebSockets,
            (Protocol::Websockets, true) => Transport::UnixWebSockets,
        }
    }

    fn is_websocket(&self) -> bool {
        matches!(self, Transport::WebSockets | Transport::UnixWebSockets)
    }

    /// Open every socket the listener needs.
    ///
    /// Must be called inside a tokio runtime. On error every socket opened so
    /// far has already been closed.
    pub fn bind(&self, config: &ListenerConfig) -> Result<Vec<ListenSocket>, BindError> {
        if let Some(tls) = &config.tls {
            if tls.psk_hint.is_some() && tls.cert_file.is_none() {
                return Err(BindError::UnsupportedProtocol(
                    "pre-shared key TLS is not supported".to_string(),
                ));
            }
        }

        match self {
            Transport::MqttSn => Err(BindError::UnsupportedProtocol(
                "mqtt-sn listeners are not supported".to_string(),
            )),
            Transport::Unix | Transport::UnixWebSockets => {
                if config.tls.is_some() {
                    return Err(BindError::UnsupportedProtocol(
                        "TLS on unix sockets is not supported".to_string(),
                    ));
                }
                let path = config
                    .unix_socket_path
                    .as_deref()
                    .ok_or_else(|| BindError::UnsupportedProtocol("unix listener without a path".to_string()))?;
                bind_unix(path).map(|socket| vec![socket])
            }
            Transport::Mqtt | Transport::WebSockets => bind_tcp(config),
        }
    }

    /// Finish the transport-level handshake on an accepted stream.
    pub async fn wrap(&self, stream: ByteStream, config: &ListenerConfig) -> Result<ClientStream, HandshakeError> {
        match self {
            Transport::MqttSn => Err(HandshakeError::Unsupported),
            t if t.is_websocket() => {
                let ws = websocket::upgrade(stream, config.mount_point.clone()).await?;
                Ok(ClientStream::WebSocket(Box::new(ws)))
            }
            _ => Ok(ClientStream::Stream(stream)),
        }
    }
}

fn bind_tcp(config: &ListenerConfig) -> Result<Vec<ListenSocket>, BindError> {
    let port = config
        .bind_port
        .ok_or_else(|| BindError::UnsupportedProtocol("tcp listener without a port".to_string()))?;
    let addrs = resolve(config.bind_host.as_deref(), port)?;

    let mut sockets: Vec<ListenSocket> = Vec::with_capacity(addrs.len());
    let mut first_error = None;
    // Port 0 asks the OS to choose; every family then shares the first choice.
    let mut chosen_port = port;

    for mut addr in addrs {
        if port == 0 {
            addr.set_port(chosen_port);
        }
        match bind_tcp_addr(addr, config.bind_interface.as_deref()) {
            Ok(listener) => {
                if chosen_port == 0 {
                    chosen_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                }
                sockets.push(ListenSocket::Tcp(listener));
            }
            Err(e) if e.is_family_unavailable() => {
                tracing::warn!(address = %addr, error = %e, "Address family unavailable, skipping");
                first_error.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }

    match (sockets.is_empty(), first_error) {
        (true, Some(e)) => Err(e),
        _ => Ok(sockets),
    }
}

fn resolve(host: Option<&str>, port: u16) -> Result<Vec<SocketAddr>, BindError> {
    let Some(host) = host else {
        return Ok(vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ]);
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let mut addrs: Vec<SocketAddr> = Vec::new();
    let resolved = (host, port).to_socket_addrs().map_err(|source| BindError::Resolve {
        host: host.to_string(),
        source,
    })?;
    for addr in resolved {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    if addrs.is_empty() {
        return Err(BindError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

fn bind_tcp_addr(addr: SocketAddr, interface: Option<&str>) -> Result<TcpListener, BindError> {
    let fail = |e: io::Error| BindError::classify(addr.to_string(), e);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP)).map_err(fail)?;
    socket.set_reuse_address(true).map_err(fail)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true).map_err(fail)?;
    }
    if let Some(interface) = interface {
        bind_to_interface(&socket, interface).map_err(fail)?;
    }
    socket.set_nonblocking(true).map_err(fail)?;
    socket.bind(&addr.into()).map_err(fail)?;
    socket.listen(LISTEN_BACKLOG).map_err(fail)?;

    let listener = TcpListener::from_std(socket.into()).map_err(fail)?;
    tracing::debug!(address = %addr, interface = ?interface, "TCP socket listening");
    Ok(listener)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_to_interface(socket: &Socket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_to_interface(_socket: &Socket, interface: &str) -> io::Result<()> {
    tracing::warn!(interface, "Binding to an interface is not supported on this platform; ignoring");
    Ok(())
}

fn bind_unix(path: &Path) -> Result<ListenSocket, BindError> {
    use std::os::unix::fs::FileTypeExt;

    let fail = |e: io::Error| BindError::classify(format!("unix:{}", path.display()), e);

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!(path = %path.display(), "Removing stale unix socket");
            std::fs::remove_file(path).map_err(fail)?;
        }
        Ok(_) => {
            return Err(fail(io::Error::new(
                io::ErrorKind::AddrInUse,
                "path exists and is not a socket",
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(fail(e)),
    }

    let listener = UnixListener::bind(path).map_err(fail)?;
    tracing::debug!(path = %path.display(), "Unix socket listening");
    Ok(ListenSocket::Unix {
        listener,
        path: path.to_path_buf(),
    })
}
