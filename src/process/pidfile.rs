//! Process id file handling.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to write pid file {path}: {source}")]
pub struct PidFileError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Record the current process id at `path`, replacing any previous content.
///
/// Call after daemonizing so the file holds the pid of the process that keeps running.
pub fn write_pid_file(path: &Path) -> Result<(), PidFileError> {
    let wrap = |source| PidFileError {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .map_err(wrap)?;
    writeln!(file, "{}", std::process::id()).map_err(wrap)?;
    file.sync_all().map_err(wrap)?;

    tracing::debug!(path = %path.display(), pid = std::process::id(), "Pid file written");
    Ok(())
}

/// Remove the pid file. A file that is already gone is not an error.
pub fn remove_pid_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Pid file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove pid file"),
    }
}

/// Read a pid file back. Used by supervisors and tests.
pub fn read_pid_file(path: &Path) -> io::Result<u32> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
