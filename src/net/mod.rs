//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerConfig
//!     → transport.rs (socket2 bind: TCP per address family, or unix path)
//!     → listener.rs (accept loop, client limit)
//!     → tls.rs (optional TLS handshake, certificate username)
//!     → websocket.rs (optional HTTP upgrade)
//!     → connection.rs (session accounting)
//!     → Hand off to the routing core
//!
//! Listener States:
//!     Bound → Serving → Stopped
//! ```
//!
//! # Design Decisions
//! - Sockets are bound synchronously so startup failures are immediate
//! - Handshakes run per connection so a slow client never blocks accept
//! - TLS contexts are swapped atomically; sockets stay open across reloads

pub mod connection;
pub mod listener;
pub mod manager;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use listener::{AcceptContext, BoundListener, ListenerId, ListenerStatus};
pub use manager::{ListenerManager, ReloadError, ReloadSummary, StartError, StatusBoard};
pub use transport::{BindError, Transport};
