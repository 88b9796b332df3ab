//! Admin HTTP API.
//!
//! ```text
//! GET  /admin/status    phase, pid, listener table
//! POST /admin/reload    same as SIGHUP
//! POST /admin/shutdown  same as SIGTERM; a second call forces exit
//! ```
//!
//! Handlers only raise `ProcessState` flags; the run loop does the work.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::require_bearer;
use self::handlers::*;
use crate::lifecycle::state::ProcessState;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::StatusBoard;

#[derive(Clone)]
pub struct AdminState {
    pub process: Arc<ProcessState>,
    pub board: StatusBoard,
    pub tracker: ConnectionTracker,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/reload", post(post_reload))
        .route("/admin/shutdown", post(post_shutdown))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AdminState, shutdown: Shutdown) {
    let addr = listener.local_addr().ok();
    tracing::info!(address = ?addr, "Admin API listening");
    let router = setup_admin_router(state);
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
    {
        tracing::error!(error = %e, "Admin API server failed");
    }
}
