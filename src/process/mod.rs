//! Process-level controls.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     daemon.rs (fork, setsid, stdio → /dev/null)
//!     → pidfile.rs (record final pid)
//!     → listeners bound elsewhere
//!     → privileges.rs (groups → gid → uid)
//!
//! Exit:
//!     pidfile.rs removes the pid file
//! ```
//!
//! # Design Decisions
//! - Daemonizing happens before the runtime exists (fork is unsafe with threads)
//! - Privilege drop fails closed: never keep serving as root by accident

pub mod daemon;
pub mod pidfile;
pub mod privileges;

pub use daemon::{DaemonError, Daemonizer};
pub use pidfile::{remove_pid_file, write_pid_file, PidFileError};
pub use privileges::{drop_privileges, PrivilegeError, PrivilegeOutcome};
