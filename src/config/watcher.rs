//! Turns edits of the configuration file into reload requests.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::lifecycle::state::ProcessState;

/// Raises the same flag SIGHUP does; the run loop performs the reload.
///
/// The parent directory is watched rather than the file itself, so editors
/// that save by writing a temporary file and renaming it are still noticed.
pub struct ConfigWatcher {
    dir: PathBuf,
    file_name: OsString,
    state: Arc<ProcessState>,
}

impl ConfigWatcher {
    pub fn new(path: &Path, state: Arc<ProcessState>) -> Self {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            dir,
            file_name: path.file_name().map(OsString::from).unwrap_or_default(),
            state,
        }
    }

    /// Start watching. Events stop once the returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher { dir, file_name, state } = self;
        let watched = dir.clone();

        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) if touches(&event, &file_name) => {
                tracing::info!(kind = ?event.kind, "Configuration file changed, requesting reload");
                state.request_reload();
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Configuration watch error"),
        };

        let mut watcher = RecommendedWatcher::new(handler, Config::default().with_poll_interval(Duration::from_secs(2)))?;
        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = %watched.display(), "Configuration watcher started");
        Ok(watcher)
    }
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|name| name == file_name.as_os_str()))
}
