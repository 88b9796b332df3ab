//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Daemonize → PID file → Bind listeners → Drop privileges → Ready
//!
//! Run loop (coordinator.rs):
//!     poll ProcessState flags
//!     → reload: re-read config, swap TLS contexts, diff listeners
//!     → shutdown: stop listeners, drain sessions, exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown flag (second one exits immediately)
//!     SIGHUP → reload flag
//! ```
//!
//! # Design Decisions
//! - Signal handlers only write atomics in state.rs
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: the drain is bounded

pub mod coordinator;
pub mod notify;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

pub use coordinator::{Coordinator, Outcome};
pub use shutdown::Shutdown;
pub use startup::{launch, StartupError};
pub use state::{Phase, ProcessState};
