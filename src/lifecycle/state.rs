//! Process-wide run state shared by the signal layer and the run loop.
//!
//! Everything a signal handler, the admin API or the config watcher may touch is
//! an atomic flag. The run loop is the only place that acts on them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Lifecycle phase of the broker process.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting = 0,
    Running = 1,
    Reloading = 2,
    Stopping = 3,
    Stopped = 4,
}

impl From<u8> for Phase {
    fn from(val: u8) -> Self {
        match val {
            1 => Phase::Running,
            2 => Phase::Reloading,
            3 => Phase::Stopping,
            4 => Phase::Stopped,
            _ => Phase::Starting,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Reloading => "reloading",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Run flags and static facts about the process.
#[derive(Debug)]
pub struct ProcessState {
    run: AtomicBool,
    reload_requested: Arc<AtomicBool>,
    shutdown_requested: Arc<AtomicBool>,
    force_requested: AtomicBool,
    phase: AtomicU8,
    daemonized: bool,
    pid_file: Option<PathBuf>,
}

impl ProcessState {
    pub fn new(daemonized: bool, pid_file: Option<PathBuf>) -> Self {
        Self {
            run: AtomicBool::new(true),
            reload_requested: Arc::new(AtomicBool::new(false)),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            force_requested: AtomicBool::new(false),
            phase: AtomicU8::new(Phase::Starting as u8),
            daemonized,
            pid_file,
        }
    }

    /// Ask the run loop to reload configuration on its next iteration.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reload request.
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    /// Ask for a graceful shutdown. A second request escalates to a forced exit.
    pub fn request_shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            self.force_requested.store(true, Ordering::SeqCst);
        }
        self.run.store(false, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn force_requested(&self) -> bool {
        self.force_requested.load(Ordering::SeqCst)
    }

    /// True while the broker should keep serving.
    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst) && !self.shutdown_requested()
    }

    pub fn phase(&self) -> Phase {
        Phase::from(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: Phase) {
        let previous = Phase::from(self.phase.swap(phase as u8, Ordering::SeqCst));
        if previous != phase {
            tracing::debug!(from = %previous, to = %phase, "Phase transition");
        }
    }

    pub fn daemonized(&self) -> bool {
        self.daemonized
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// Flag set by the reload signal. Only meant for signal registration.
    pub(crate) fn reload_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reload_requested)
    }

    /// Flag set by termination signals. Only meant for signal registration.
    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_requested)
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new(false, None)
    }
}
