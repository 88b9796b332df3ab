//! Listener manager.
//!
//! Owns every `BoundListener`. The coordinator is the only caller of the
//! mutating methods, so the table needs no locking; the admin API reads a
//! published `StatusBoard` instead.
//!
//! # Lifecycle
//! ```text
//! start_all / add_local_only  (bind, all-or-nothing)
//!     → serve                 (spawn accept tasks)
//!     → reload_certificates   (swap TLS contexts in place)
//!     → apply                 (diff listener set by endpoint key)
//!     → stop_all              (idempotent)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::config::{ConfigError, ListenerConfig};
use crate::net::listener::{AcceptContext, BoundListener, ListenerHandle, ListenerStatus};
use crate::net::tls::TlsError;
use crate::net::transport::BindError;
use crate::observability::metrics;

/// Startup bind failure. Nothing from the same call is left bound.
#[derive(Debug, Error)]
#[error("listener {listener_index} ({endpoint}) failed to start: {cause}")]
pub struct StartError {
    pub listener_index: usize,
    pub endpoint: String,
    #[source]
    pub cause: BindError,
}

/// A reload step that failed. The broker keeps serving.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("listener {index} ({endpoint}): certificate reload failed: {source}")]
    CertLoad {
        index: usize,
        endpoint: String,
        #[source]
        source: TlsError,
    },

    #[error("listener {index} ({endpoint}): bind failed: {source}")]
    Bind {
        index: usize,
        endpoint: String,
        #[source]
        source: BindError,
    },

    #[error("configuration reload failed: {0}")]
    Config(#[from] ConfigError),
}

/// What `apply` changed.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    pub kept: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub errors: Vec<ReloadError>,
}

impl ReloadSummary {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.restarted.is_empty() && self.errors.is_empty()
    }
}

/// Shared, lock-free view of the listener table.
#[derive(Clone, Default)]
pub struct StatusBoard(Arc<ArcSwap<Vec<ListenerHandle>>>);

impl StatusBoard {
    pub fn snapshot(&self) -> Vec<ListenerStatus> {
        self.0.load().iter().map(ListenerHandle::status).collect()
    }

    fn publish(&self, handles: Vec<ListenerHandle>) {
        self.0.store(Arc::new(handles));
    }
}

/// Wrap owned configs for sharing with bound listeners.
pub fn share(configs: &[ListenerConfig]) -> Vec<Arc<ListenerConfig>> {
    configs.iter().cloned().map(Arc::new).collect()
}

/// Loopback listeners used when nothing is configured.
pub fn local_only_configs(port: u16) -> Vec<Arc<ListenerConfig>> {
    vec![
        Arc::new(ListenerConfig::tcp(Some("127.0.0.1"), port)),
        Arc::new(ListenerConfig::tcp(Some("::1"), port)),
    ]
}

pub struct ListenerManager {
    listeners: Vec<BoundListener>,
    ctx: AcceptContext,
    global_limit: Option<usize>,
    board: StatusBoard,
}

impl ListenerManager {
    pub fn new(ctx: AcceptContext, global_limit: Option<usize>) -> Self {
        Self {
            listeners: Vec::new(),
            ctx,
            global_limit,
            board: StatusBoard::default(),
        }
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn listeners(&self) -> &[BoundListener] {
        &self.listeners
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Update the broker-wide client limit used for listeners bound from now on.
    pub fn set_global_limit(&mut self, limit: Option<usize>) {
        self.global_limit = limit;
    }

    /// Bind every config in order. On failure every listener bound by this
    /// call is closed again and the table is left as it was.
    pub fn start_all(&mut self, configs: &[Arc<ListenerConfig>]) -> Result<(), StartError> {
        let mut bound = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            match BoundListener::bind(index, Arc::clone(config), self.global_limit, self.ctx.clone()) {
                Ok(listener) => bound.push(listener),
                Err(cause) => {
                    let endpoint = config.endpoint_key();
                    tracing::error!(index, endpoint = %endpoint, error = %cause, "Listener failed to bind");
                    // Dropping closes the sockets and unlinks unix socket files.
                    drop(bound);
                    return Err(StartError {
                        listener_index: index,
                        endpoint,
                        cause,
                    });
                }
            }
        }
        self.listeners.extend(bound);
        self.publish();
        Ok(())
    }

    /// Bind plain MQTT on both loopback addresses. One family missing is fine.
    pub fn add_local_only(&mut self, port: u16) -> Result<(), StartError> {
        let mut first_error = None;
        let mut bound = 0;
        for (index, config) in local_only_configs(port).into_iter().enumerate() {
            let endpoint = config.endpoint_key();
            match BoundListener::bind(index, config, self.global_limit, self.ctx.clone()) {
                Ok(listener) => {
                    self.listeners.push(listener);
                    bound += 1;
                }
                Err(cause) => {
                    tracing::warn!(endpoint = %endpoint, error = %cause, "Local-only listener failed to bind");
                    first_error.get_or_insert(StartError {
                        listener_index: index,
                        endpoint,
                        cause,
                    });
                }
            }
        }
        self.publish();
        match first_error {
            Some(e) if bound == 0 => Err(e),
            _ => {
                tracing::info!(port, "No listeners configured, accepting local connections only");
                Ok(())
            }
        }
    }

    /// Start accept tasks on every listener not yet serving.
    pub fn serve(&mut self) {
        for listener in &mut self.listeners {
            listener.serve();
        }
        self.publish();
    }

    /// Stop and close every listener. Safe to call repeatedly.
    pub async fn stop_all(&mut self) {
        for mut listener in self.listeners.drain(..) {
            listener.stop().await;
        }
        self.publish();
    }

    /// Rebuild TLS contexts whose configuration or files changed.
    ///
    /// Listeners are matched to `configs` by endpoint key. Listeners whose
    /// other settings changed are left to `apply`, which rebinds them. A
    /// failure leaves that listener on its previous context and does not stop
    /// the others.
    pub fn reload_certificates(&self, configs: &[Arc<ListenerConfig>]) -> Vec<ReloadError> {
        let desired: HashMap<String, &Arc<ListenerConfig>> =
            configs.iter().map(|c| (c.endpoint_key(), c)).collect();

        let mut errors = Vec::new();
        for listener in &self.listeners {
            let Some(config) = desired.get(listener.endpoint_key()) else {
                continue;
            };
            if !listener.config().same_apart_from_tls(config) {
                continue;
            }
            let Some(tls) = config.tls.as_ref() else {
                continue;
            };
            if let Err(source) = listener.reload_tls(tls) {
                tracing::error!(
                    listener = %listener.id(),
                    endpoint = %listener.endpoint_key(),
                    error = %source,
                    "Certificate reload failed, keeping previous context"
                );
                metrics::on_cert_reload_failure(listener.endpoint_key());
                errors.push(ReloadError::CertLoad {
                    index: listener.index(),
                    endpoint: listener.endpoint_key().to_string(),
                    source,
                });
            }
        }
        errors
    }

    /// Move the listener table to `configs`.
    ///
    /// Listeners whose endpoint disappeared or whose settings (other than the
    /// TLS block) changed are stopped first; new and changed ones are then
    /// bound and served. Bind failures are reported, not fatal.
    pub async fn apply(&mut self, configs: &[Arc<ListenerConfig>]) -> ReloadSummary {
        let desired: HashMap<String, (usize, &Arc<ListenerConfig>)> = configs
            .iter()
            .enumerate()
            .map(|(index, c)| (c.endpoint_key(), (index, c)))
            .collect();

        let mut summary = ReloadSummary::default();
        let mut kept = Vec::with_capacity(self.listeners.len());
        let mut retiring = Vec::new();

        for mut listener in self.listeners.drain(..) {
            match desired.get(listener.endpoint_key()) {
                Some((index, config)) if listener.config().same_apart_from_tls(config) => {
                    listener.set_index(*index);
                    kept.push(listener);
                }
                Some(_) => {
                    summary.restarted.push(listener.endpoint_key().to_string());
                    retiring.push(listener);
                }
                None => {
                    summary.removed.push(listener.endpoint_key().to_string());
                    retiring.push(listener);
                }
            }
        }

        for mut listener in retiring {
            listener.stop().await;
        }

        let present: HashSet<String> = kept.iter().map(|l| l.endpoint_key().to_string()).collect();
        summary.kept = kept.len();
        self.listeners = kept;

        for (index, config) in configs.iter().enumerate() {
            let endpoint = config.endpoint_key();
            if present.contains(&endpoint) {
                continue;
            }
            match BoundListener::bind(index, Arc::clone(config), self.global_limit, self.ctx.clone()) {
                Ok(mut listener) => {
                    listener.serve();
                    if !summary.restarted.contains(&endpoint) {
                        summary.added.push(endpoint);
                    }
                    self.listeners.push(listener);
                }
                Err(source) => {
                    tracing::error!(index, endpoint = %endpoint, error = %source, "Listener failed to bind during reload");
                    summary.errors.push(ReloadError::Bind { index, endpoint, source });
                }
            }
        }

        self.listeners.sort_by_key(BoundListener::index);
        self.publish();

        tracing::info!(
            kept = summary.kept,
            added = ?summary.added,
            removed = ?summary.removed,
            restarted = ?summary.restarted,
            failed = summary.errors.len(),
            "Listener set applied"
        );
        summary
    }

    pub fn statuses(&self) -> Vec<ListenerStatus> {
        self.listeners.iter().map(BoundListener::status).collect()
    }

    fn publish(&self) {
        self.board.publish(self.listeners.iter().map(BoundListener::handle).collect());
    }
}
