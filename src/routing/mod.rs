//! Handoff to the message-routing core.
//!
//! # Data Flow
//! ```text
//! Listener accept task
//!     → handshake (TLS, WebSocket, identity)
//!     → AcceptedConnection
//!     → RoutingCore::accept (core owns the session from here)
//!
//! Shutdown:
//!     listeners stopped → RoutingCore::drain → tracked sessions close
//! ```
//!
//! # Design Decisions
//! - The core is a trait object so the bootstrap never depends on packet handling
//! - Each connection carries a `SessionGuard`; dropping it is what ends drain tracking

pub mod channel;
pub mod hold;

use crate::config::Protocol;
use crate::net::connection::SessionGuard;
use crate::net::listener::ListenerId;
use crate::net::stream::{ClientStream, PeerAddr};

pub use channel::ChannelCore;
pub use hold::HoldingCore;

/// A fully established client transport, ready for MQTT.
#[derive(Debug)]
pub struct AcceptedConnection {
    pub listener_id: ListenerId,
    pub protocol: Protocol,
    pub peer: PeerAddr,
    /// Username negotiated from the client certificate, if the listener asks for one.
    pub username: Option<String>,
    pub max_qos: u8,
    pub max_topic_alias: u16,
    pub stream: ClientStream,
    pub session: SessionGuard,
}

/// The external routing engine as seen by the listener layer.
pub trait RoutingCore: Send + Sync + 'static {
    /// Take ownership of a new connection. Must not block.
    fn accept(&self, conn: AcceptedConnection);

    /// Begin closing sessions; called once listeners have stopped.
    fn drain(&self) {}
}
