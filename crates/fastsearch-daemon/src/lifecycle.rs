//! Daemon lifecycle: socket and PID file ownership, pinned-slot preload,
//! signal handling, and cleanup.

use crate::client;
use crate::server::Daemon;
use anyhow::{Context, Result, bail};
use fastsearch_core::{FastSearchConfig, KeepLoaded};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Run the daemon to completion.
///
/// Binds the socket (refusing to start when a live daemon already answers
/// on it), writes the PID file, preloads pinned slots, serves until a
/// signal or a `shutdown` request, then tears everything down. Startup
/// failures return an error so the process exits non-zero.
pub async fn run_daemon(config: FastSearchConfig) -> Result<()> {
    let socket_path = PathBuf::from(&config.daemon.socket_path);
    if socket_path.exists() {
        if client::ping(&socket_path).await {
            bail!("daemon already running at {}", socket_path.display());
        }
        info!(path = %socket_path.display(), "removing stale socket file");
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind socket {}", socket_path.display()))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to chmod socket {}", socket_path.display()))?;

    let pid_path = PathBuf::from(&config.daemon.pid_path);
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", pid_path.display()))?;

    let daemon = Daemon::new(config.clone());

    // Pinned slots load at startup; failures are logged, not fatal.
    for (slot, model_config) in &config.models {
        if model_config.keep_loaded == KeepLoaded::Always {
            if let Err(e) = daemon.manager().load_model(slot).await {
                error!(slot = %slot, error = %format!("{e:#}"), "failed to preload model");
            }
        }
    }

    install_signal_handlers(daemon.clone());
    info!(socket = %socket_path.display(), "fastsearch daemon started");

    daemon.serve(listener).await;

    info!("shutting down fastsearch daemon");
    daemon.manager().shutdown();
    remove_if_present(&socket_path);
    remove_if_present(&pid_path);
    info!("fastsearch daemon stopped");
    Ok(())
}

/// SIGTERM and SIGINT both set the shutdown flag; the accept loop notices
/// on its next iteration.
fn install_signal_handlers(daemon: std::sync::Arc<Daemon>) {
    tokio::spawn(async move {
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = interrupt.recv() => info!("received SIGINT"),
        }
        daemon.request_shutdown();
    });
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "cleanup failed");
        }
    }
}
