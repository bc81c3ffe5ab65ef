//! OS-signal handling for the worker process.
//!
//! SIGINT/SIGTERM cancel the flow token: in-flight steps observe the
//! cancellation at their next await point, commit nothing further, and the
//! flows exit with their progress persisted. This is deliberately distinct
//! from the control-plane shutdown signal on `FlowControl`, which tears a
//! mirror down; stopping the process must never drop slots or tables.
//! A second signal skips the graceful wind-down and exits immediately.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// SIGINT exit code, also used for the forced second-signal exit.
pub const SHUTDOWN_EXIT_CODE: i32 = 130;

/// Installs the two-stage signal handling and returns. The spawned task
/// lives for the rest of the process.
pub fn install_signal_handling(cancel: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_stop_signal().await;
        info!(signal, "stop signal received, cancelling flows");
        cancel.cancel();

        let signal = wait_for_stop_signal().await;
        warn!(signal, "second stop signal, exiting without waiting");
        std::process::exit(SHUTDOWN_EXIT_CODE);
    });
}

/// Resolves with the name of whichever stop signal fires first.
async fn wait_for_stop_signal() -> &'static str {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
