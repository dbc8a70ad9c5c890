//! Shutdown signal watching.
//!
//! A watcher waits for a shutdown trigger and cancels a token. Workers
//! only ever look at the token, so a process signal, a test harness or a
//! supervisor can all stop them the same way.

use std::future::Future;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolves on the first SIGINT (ctrl-c) or, on unix, SIGTERM.
///
/// If a handler cannot be installed that source is skipped rather than
/// failing the caller.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler, continuing without it");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, continuing without it");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "shutdown signal received"),
        _ = terminate => info!(signal = "SIGTERM", "shutdown signal received"),
    }
}

/// Cancel `token` when `trigger` resolves.
///
/// The watcher also exits quietly if the token is cancelled some other
/// way first.
pub fn watch<F>(token: CancellationToken, trigger: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = trigger => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}
