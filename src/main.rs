//! mqttd broker process.
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                        mqttd                         │
//!   TCP / TLS /    │  ┌───────────┐   ┌──────────┐   ┌────────────────┐   │
//!   WebSocket /  ──┼─▶│ transport │──▶│ listener │──▶│ routing core   │   │
//!   unix socket    │  │  binder   │   │  manager │   │ (handoff)      │   │
//!                  │  └───────────┘   └────▲─────┘   └────────────────┘   │
//!                  │                       │ start / reload / stop        │
//!                  │  ┌──────────┐   ┌─────┴───────┐   ┌──────────────┐   │
//!   SIGHUP/TERM ───┼─▶│ signals  │──▶│ coordinator │◀──│ admin API /  │   │
//!                  │  └──────────┘   └─────────────┘   │ file watcher │   │
//!                  │                                   └──────────────┘   │
//!                  │  daemonize · pid file · privilege drop               │
//!                  └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use mqttd::config::{FileSource, Overrides};
use mqttd::lifecycle::launch;

#[derive(Parser)]
#[command(name = "mqttd", version, about = "MQTT broker")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Detach from the terminal and run in the background.
    #[arg(short, long)]
    daemon: bool,

    /// Listen on this port with plain MQTT, replacing configured listeners. Repeatable.
    #[arg(short, long = "port")]
    port: Vec<u16>,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let source = FileSource::new(
        cli.config,
        Overrides {
            ports: cli.port,
            daemon: cli.daemon,
        },
    );

    match launch(Arc::new(source), cli.verbose) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            eprintln!("mqttd: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
