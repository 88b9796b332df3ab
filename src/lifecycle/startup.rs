//! Startup orchestration.
//!
//! # Order
//! ```text
//! load config → logging → daemonize → pid file → runtime → signals
//!     → bind listeners → bind admin/metrics → drop privileges
//!     → serve → READY=1 → coordinator run loop
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and maps to its own exit code
//! - Fork happens before the tokio runtime exists
//! - Every privileged resource is acquired before privileges are dropped

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::admin::{self, AdminState};
use crate::config::watcher::ConfigWatcher;
use crate::config::{BrokerConfig, ConfigError, ConfigSource};
use crate::lifecycle::coordinator::{Coordinator, Outcome};
use crate::lifecycle::notify::ServiceNotifier;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals;
use crate::lifecycle::state::ProcessState;
use crate::net::connection::ConnectionTracker;
use crate::net::manager::{share, ListenerManager, StartError};
use crate::net::AcceptContext;
use crate::observability::{logging, metrics};
use crate::process::daemon::{DaemonError, Daemonizer};
use crate::process::pidfile::{remove_pid_file, write_pid_file, PidFileError};
use crate::process::privileges::{drop_privileges, PrivilegeError};
use crate::routing::{HoldingCore, RoutingCore};
use crate::security::PassThrough;

/// Fatal startup failure.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging setup failed: {0}")]
    Logging(#[from] logging::LoggingError),

    #[error("failed to daemonize: {0}")]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error(transparent)]
    Bind(#[from] StartError),

    #[error("failed to drop privileges: {0}")]
    Privileges(#[from] PrivilegeError),

    #[error("failed to start {endpoint} endpoint on {address}: {reason}")]
    Endpoint {
        endpoint: &'static str,
        address: String,
        reason: String,
    },

    #[error("failed to build async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl StartupError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) | StartupError::Logging(_) => 2,
            StartupError::Daemon(_) => 3,
            StartupError::PidFile(_) => 4,
            StartupError::Signals(_) => 5,
            StartupError::Bind(_) => 6,
            StartupError::Privileges(_) => 7,
            StartupError::Endpoint { .. } => 8,
            StartupError::Runtime(_) => 1,
        }
    }
}

/// Removes the pid file when the broker exits, on any path.
struct PidFileGuard(PathBuf);

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        remove_pid_file(&self.0);
    }
}

/// Run the broker process to completion.
///
/// Called from a plain (non-async) `main`; builds the runtime itself.
pub fn launch(source: Arc<dyn ConfigSource>, verbose: bool) -> Result<Outcome, StartupError> {
    let config = source.load()?;
    logging::init(&config.observability, verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mqttd starting");

    let mut daemonized = false;
    if config.daemon {
        match Daemonizer::platform().daemonize() {
            Ok(()) => daemonized = true,
            Err(DaemonError::Unsupported) => {
                tracing::warn!("Daemon mode is not supported on this platform, staying in the foreground")
            }
            Err(e) => return Err(e.into()),
        }
    }

    let state = Arc::new(ProcessState::new(daemonized, config.pid_file.clone()));
    let _pid_guard = match &config.pid_file {
        Some(path) => {
            write_pid_file(path)?;
            Some(PidFileGuard(path.clone()))
        }
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;

    let outcome = runtime.block_on(serve(config, state, source, Arc::new(HoldingCore::new())))?;
    tracing::info!(outcome = ?outcome, "Shutdown complete");
    Ok(outcome)
}

/// Bind everything, drop privileges and run the coordinator.
///
/// Must run inside a tokio runtime.
pub async fn serve(
    config: BrokerConfig,
    state: Arc<ProcessState>,
    source: Arc<dyn ConfigSource>,
    core: Arc<dyn RoutingCore>,
) -> Result<Outcome, StartupError> {
    signals::register(&state).map_err(StartupError::Signals)?;

    let tracker = ConnectionTracker::new();
    let ctx = AcceptContext {
        core: Arc::clone(&core),
        identity: Arc::new(PassThrough),
        tracker: tracker.clone(),
        handshake_timeout: Duration::from_secs(config.lifecycle.handshake_timeout_secs),
    };

    let mut manager = ListenerManager::new(ctx, config.max_connections);
    if config.listeners.is_empty() {
        manager.add_local_only(config.local_only_port)?;
    } else {
        manager.start_all(&share(&config.listeners))?;
    }

    if config.observability.metrics_enabled {
        let address = parse_endpoint("metrics", &config.observability.metrics_address)?;
        metrics::init_metrics(address).map_err(|e| StartupError::Endpoint {
            endpoint: "metrics",
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    }

    let shutdown = Shutdown::new();
    if config.admin.enabled {
        let address = parse_endpoint("admin", &config.admin.bind_address)?;
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|e| StartupError::Endpoint {
                endpoint: "admin",
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let admin_state = AdminState {
            process: Arc::clone(&state),
            board: manager.board(),
            tracker: tracker.clone(),
            api_key: Arc::from(config.admin.api_key.as_str()),
        };
        tokio::spawn(admin::serve(listener, admin_state, shutdown.clone()));
    }

    drop_privileges(config.user.as_deref())?;

    let _watcher = match source.watch_path() {
        Some(path) if config.lifecycle.watch_config => match ConfigWatcher::new(path, Arc::clone(&state)).run() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Config watcher unavailable");
                None
            }
        },
        _ => None,
    };

    manager.serve();

    let notifier = ServiceNotifier::new();
    let status = format!("Serving {} listener(s)", manager.listeners().len());
    if let Err(e) = notifier.ready(Some(&status)) {
        tracing::warn!(error = %e, "Failed to notify service manager about readiness");
    }

    let coordinator = Coordinator::new(state, source, manager, core, tracker, &config.lifecycle)
        .with_notifier(notifier)
        .with_shutdown(shutdown);
    Ok(coordinator.run().await)
}

fn parse_endpoint(endpoint: &'static str, address: &str) -> Result<SocketAddr, StartupError> {
    address.parse().map_err(|e: std::net::AddrParseError| StartupError::Endpoint {
        endpoint,
        address: address.to_string(),
        reason: e.to_string(),
    })
}
