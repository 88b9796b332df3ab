//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals into `ProcessState` flags
//!
//! # Design Decisions
//! - Handlers only store to atomics (signal-hook flag registration)
//! - A second SIGTERM/SIGINT while a shutdown is pending exits immediately
//! - SIGHUP triggers config reload, not shutdown

use std::io;

use crate::lifecycle::state::ProcessState;

/// Exit status used when a second termination signal forces the process down.
pub fn forced_exit_code(signal: i32) -> i32 {
    128 + signal
}

/// Install the broker's signal handlers.
///
/// For each termination signal the conditional exit is registered before the
/// flag setter, so the first delivery only raises the flag and any later one
/// terminates the process without draining.
#[cfg(unix)]
pub fn register(state: &ProcessState) -> io::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;

    for signal in [SIGTERM, SIGINT] {
        flag::register_conditional_shutdown(signal, forced_exit_code(signal), state.shutdown_flag())?;
        flag::register(signal, state.shutdown_flag())?;
    }
    flag::register(SIGHUP, state.reload_flag())?;

    tracing::debug!("Signal handlers installed");
    Ok(())
}

/// No-op registration for platforms without POSIX signals.
#[cfg(not(unix))]
pub fn register(_state: &ProcessState) -> io::Result<()> {
    tracing::warn!("Signal handling is not available on this platform");
    Ok(())
}
