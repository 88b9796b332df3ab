//! Service-manager readiness notifications (`sd_notify` protocol).
//!
//! Messages are datagrams of `KEY=VALUE` lines sent to the socket named by
//! `$NOTIFY_SOCKET`. Without that variable every call is a no-op.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct ServiceNotifier {
    socket: Option<PathBuf>,
}

impl ServiceNotifier {
    /// Notifier for the socket in `$NOTIFY_SOCKET`, if any.
    pub fn new() -> Self {
        Self {
            socket: std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from),
        }
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(path.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    pub fn ready(&self, status: Option<&str>) -> io::Result<()> {
        match status {
            Some(status) => self.send(&format!("READY=1\nSTATUS={status}\nMAINPID={}", std::process::id())),
            None => self.send(&format!("READY=1\nMAINPID={}", std::process::id())),
        }
    }

    pub fn reloading(&self) -> io::Result<()> {
        self.send("RELOADING=1")
    }

    pub fn stopping(&self) -> io::Result<()> {
        self.send("STOPPING=1")
    }

    pub fn status(&self, status: &str) -> io::Result<()> {
        self.send(&format!("STATUS={status}"))
    }

    fn send(&self, message: &str) -> io::Result<()> {
        let Some(path) = &self.socket else {
            return Ok(());
        };
        let socket = UnixDatagram::unbound()?;
        send_to(&socket, path, message.as_bytes())?;
        tracing::trace!(message, "Service manager notified");
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_to(socket: &UnixDatagram, path: &std::path::Path, payload: &[u8]) -> io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::ffi::OsStrExt;

    match path.as_os_str().as_bytes().strip_prefix(b"@") {
        Some(name) => {
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            socket.send_to_addr(payload, &addr)
        }
        None => socket.send_to(payload, path),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_to(socket: &UnixDatagram, path: &std::path::Path, payload: &[u8]) -> io::Result<usize> {
    socket.send_to(payload, path)
}
