//! Detaching from the controlling terminal.
//!
//! Forking is only sound while the process is single threaded, so `daemonize`
//! runs before the async runtime is built.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("fork failed: {0}")]
    Fork(std::io::Error),

    #[error("setsid failed: {0}")]
    Setsid(std::io::Error),

    #[error("failed to redirect {stream} to /dev/null: {source}")]
    Redirect {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon mode is not supported on this platform")]
    Unsupported,
}

/// Platform strategy for running in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemonizer {
    /// fork + setsid + stdio redirection.
    Fork,
    /// Platforms without fork semantics.
    Unsupported,
}

impl Daemonizer {
    /// The strategy available on the current platform.
    pub fn platform() -> Self {
        if cfg!(unix) {
            Daemonizer::Fork
        } else {
            Daemonizer::Unsupported
        }
    }

    /// Detach into the background.
    ///
    /// Returns only in the child; the parent exits with status 0. On
    /// `Unsupported` the caller should keep running in the foreground.
    pub fn daemonize(self) -> Result<(), DaemonError> {
        match self {
            Daemonizer::Fork => fork_and_detach(),
            Daemonizer::Unsupported => Err(DaemonError::Unsupported),
        }
    }
}

#[cfg(unix)]
fn fork_and_detach() -> Result<(), DaemonError> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: called before any other thread is spawned.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(errno) => return Err(DaemonError::Fork(errno.into())),
    }

    setsid().map_err(|errno| DaemonError::Setsid(errno.into()))?;
    redirect_stdio()
}

#[cfg(not(unix))]
fn fork_and_detach() -> Result<(), DaemonError> {
    Err(DaemonError::Unsupported)
}

#[cfg(unix)]
fn redirect_stdio() -> Result<(), DaemonError> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|source| DaemonError::Redirect {
            stream: "stdio",
            source,
        })?;

    for (stream, fd) in [
        ("stdin", libc::STDIN_FILENO),
        ("stdout", libc::STDOUT_FILENO),
        ("stderr", libc::STDERR_FILENO),
    ] {
        nix::unistd::dup2(devnull.as_raw_fd(), fd).map_err(|errno| DaemonError::Redirect {
            stream,
            source: errno.into(),
        })?;
    }
    Ok(())
}
