use std::path::PathBuf;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use super::AdminState;
use crate::lifecycle::state::Phase;
use crate::net::ListenerStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub pid: u32,
    pub phase: Phase,
    pub daemonized: bool,
    pub pid_file: Option<PathBuf>,
    pub active_sessions: usize,
    pub listeners: Vec<ListenerStatus>,
}

#[derive(Serialize)]
pub struct Accepted {
    pub accepted: bool,
    pub action: &'static str,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
        phase: state.process.phase(),
        daemonized: state.process.daemonized(),
        pid_file: state.process.pid_file().map(PathBuf::from),
        active_sessions: state.tracker.active_count(),
        listeners: state.board.snapshot(),
    })
}

pub async fn post_reload(State(state): State<AdminState>) -> (StatusCode, Json<Accepted>) {
    tracing::info!("Reload requested through admin API");
    state.process.request_reload();
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            action: "reload",
        }),
    )
}

pub async fn post_shutdown(State(state): State<AdminState>) -> (StatusCode, Json<Accepted>) {
    tracing::info!("Shutdown requested through admin API");
    state.process.request_shutdown();
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            action: "shutdown",
        }),
    )
}
