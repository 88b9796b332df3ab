//! Signal/reload coordinator.
//!
//! # Phases
//! ```text
//! Starting → Running ⇄ Reloading
//!               ↓
//!           Stopping → Stopped
//! ```
//!
//! Signals, the admin API and the config watcher only raise flags on
//! `ProcessState`. The run loop polls them at a fixed interval and does all
//! the work itself, so it is the single writer of the listener table.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigSource, LifecycleConfig};
use crate::lifecycle::notify::ServiceNotifier;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::state::{Phase, ProcessState};
use crate::net::connection::ConnectionTracker;
use crate::net::manager::{local_only_configs, share, ListenerManager, ReloadError, ReloadSummary};
use crate::observability::metrics;
use crate::routing::RoutingCore;

/// How the run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every session closed within the drain timeout.
    Graceful,
    /// Sessions were still open when the drain timeout expired.
    DrainTimedOut,
    /// A second termination request cut the drain short.
    Forced,
}

pub struct Coordinator {
    state: Arc<ProcessState>,
    source: Arc<dyn ConfigSource>,
    manager: ListenerManager,
    core: Arc<dyn RoutingCore>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    notifier: ServiceNotifier,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        state: Arc<ProcessState>,
        source: Arc<dyn ConfigSource>,
        manager: ListenerManager,
        core: Arc<dyn RoutingCore>,
        tracker: ConnectionTracker,
        settings: &LifecycleConfig,
    ) -> Self {
        Self {
            state,
            source,
            manager,
            core,
            tracker,
            shutdown: Shutdown::new(),
            notifier: ServiceNotifier::default(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            drain_timeout: Duration::from_secs(settings.drain_timeout_secs),
        }
    }

    pub fn with_notifier(mut self, notifier: ServiceNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use an existing shutdown signal, so tasks started earlier follow the broker down.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn manager(&self) -> &ListenerManager {
        &self.manager
    }

    /// Serve until a termination request, handling reloads on the way.
    pub async fn run(mut self) -> Outcome {
        self.state.set_phase(Phase::Running);
        tracing::info!(listeners = self.manager.listeners().len(), "Broker running");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.state.shutdown_requested() {
                break;
            }
            if self.state.take_reload_request() {
                if let Err(e) = self.reload().await {
                    tracing::error!(error = %e, "Reload aborted, keeping current configuration");
                }
            }
        }

        self.stop().await
    }

    /// Re-read configuration and bring TLS contexts and listeners in line with it.
    pub async fn reload(&mut self) -> Result<ReloadSummary, ReloadError> {
        self.state.set_phase(Phase::Reloading);
        if let Err(e) = self.notifier.reloading() {
            tracing::warn!(error = %e, "Failed to notify service manager about reload");
        }
        tracing::info!("Reloading configuration");

        let result = self.reload_inner().await;

        self.state.set_phase(Phase::Running);
        if let Err(e) = self.notifier.ready(None) {
            tracing::warn!(error = %e, "Failed to notify service manager about readiness");
        }
        result
    }

    async fn reload_inner(&mut self) -> Result<ReloadSummary, ReloadError> {
        let config = self.source.load()?;
        self.manager.set_global_limit(config.max_connections);

        let desired = if config.listeners.is_empty() {
            local_only_configs(config.local_only_port)
        } else {
            share(&config.listeners)
        };

        let mut errors = self.manager.reload_certificates(&desired);
        let mut summary = self.manager.apply(&desired).await;
        errors.append(&mut summary.errors);
        summary.errors = errors;

        metrics::on_reload();
        for error in &summary.errors {
            tracing::warn!(error = %error, "Reload step failed");
        }
        Ok(summary)
    }

    /// Stop listeners, then give sessions up to the drain timeout to close.
    async fn stop(&mut self) -> Outcome {
        self.state.set_phase(Phase::Stopping);
        if let Err(e) = self.notifier.stopping() {
            tracing::warn!(error = %e, "Failed to notify service manager about shutdown");
        }
        tracing::info!("Shutting down, no longer accepting connections");

        self.manager.stop_all().await;
        self.shutdown.trigger();
        self.core.drain();

        let state = Arc::clone(&self.state);
        let poll = self.poll_interval;
        let forced = async move {
            while !state.force_requested() {
                tokio::time::sleep(poll).await;
            }
        };

        let outcome = tokio::select! {
            biased;

            _ = forced => Outcome::Forced,
            _ = self.tracker.wait_for_drain() => Outcome::Graceful,
            _ = tokio::time::sleep(self.drain_timeout) => Outcome::DrainTimedOut,
        };

        match outcome {
            Outcome::Graceful => tracing::info!("All sessions closed"),
            Outcome::DrainTimedOut => tracing::warn!(
                open_sessions = self.tracker.active_count(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain timeout expired with sessions still open"
            ),
            Outcome::Forced => tracing::warn!(
                open_sessions = self.tracker.active_count(),
                "Second termination request, exiting without drain"
            ),
        }

        self.state.set_phase(Phase::Stopped);
        outcome
    }
}
