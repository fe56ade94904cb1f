//! Process signal handling
//!
//! The kube-runtime controllers stop on their own through
//! `shutdown_on_signal`, but they wait for in-flight reconciles. Cancelling
//! the shared token on the same signals makes a reconcile that is polling a
//! validation pod return at once.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `cancel` on the first SIGTERM or SIGINT.
///
/// Handlers are registered before this returns, so a signal sent right after
/// the call is not lost.
pub fn cancel_on_signal(cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = cancel.cancelled() => return,
        };
        tracing::info!(signal = received, "Shutdown signal received");
        cancel.cancel();
    }))
}
