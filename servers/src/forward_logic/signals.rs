use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};
use tokio::signal;
use tracing::{error, info};

use lib_forward::core::BrokerHandle;

/// # Shutdown Signal
///
/// Completes on Ctrl+C or, on UNIX systems, on SIGTERM. A handler that cannot
/// be installed is logged and never completes, leaving the other one in charge.
pub async fn shutdown_signal() {
    // Handler for CTRL+C
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received, initiating shutdown.");
    };

    // Handler for SIGTERM (on UNIX systems)
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-UNIX systems, `terminate` is a future that never completes.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// # Spawn Signal Listener
///
/// The broker loop is synchronous and owns the main thread, so signals are
/// awaited on a helper thread with its own current-thread runtime. When one
/// arrives the broker is asked to stop.
pub fn spawn_signal_listener(handle: BrokerHandle) -> Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    thread::Builder::new()
        .name("forward-signals".to_string())
        .spawn(move || {
            runtime.block_on(shutdown_signal());
            if let Err(e) = handle.shutdown() {
                error!(error = %e, "failed to wake broker for shutdown");
            }
        })
        .context("failed to spawn signal thread")
}
