//! Listener setup and graceful shutdown

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use realtime_core::ListenTarget;

/// Bind the listening endpoint and serve until `shutdown` resolves
///
/// A Unix socket path replaces the TCP listener entirely. A stale socket file
/// left by a previous run is removed before binding and again on exit.
pub async fn serve<F>(target: &ListenTarget, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match target {
        ListenTarget::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            info!(listen = %target, "Realtime service listening");

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .context("HTTP server error")?;
        }
        #[cfg(unix)]
        ListenTarget::Unix(path) => {
            let listener = bind_unix(path)?;
            info!(listen = %target, "Realtime service listening");

            let result = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await;
            remove_socket_file(path);
            result.context("HTTP server error")?;
        }
        #[cfg(not(unix))]
        ListenTarget::Unix(_) => {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    }

    Ok(())
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<tokio::net::UnixListener> {
    use std::os::unix::fs::FileTypeExt;

    // symlink_metadata so a link is never followed and deleted through
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            anyhow::bail!("Refusing to replace {}: not a socket file", path.display());
        }
        warn!(path = %path.display(), "Removing stale socket file");
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }

    tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind Unix socket {}", path.display()))
}

#[cfg(unix)]
fn remove_socket_file(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
