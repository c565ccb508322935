mod backup;
mod batch;
mod calc;
mod clo_rollup;
mod course_results;
mod db;
mod error;
mod indirect;
mod ipc;
mod plo_rollup;
mod program_summary;
mod query;
mod reports;
mod settings;
mod thresholds;

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Outcome attainment sidecar: JSON requests on stdin, one JSON reply per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "attaind", version)]
struct Cli {
    /// Workspace directory to open at start-up.
    #[arg(long, env = "ATTAIND_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // stdout carries the protocol.
    fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let mut state = ipc::AppState::default();
    if let Some(path) = cli.workspace {
        match state.select_workspace(&path) {
            Ok(()) => info!(workspace = %path.display(), "workspace opened"),
            Err(e) => error!(workspace = %path.display(), error = %e, "failed to open workspace"),
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "attaind ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("stdin closed, exiting");
}
