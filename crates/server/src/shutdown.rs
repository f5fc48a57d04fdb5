//! Shutdown signal handling.
//!
//! The server must leave through its normal exit path: dropping the
//! [`rollout_cache_core::RolloutStore`] is what unlinks the OS
//! shared-memory region, and a killed process leaves a stale region behind
//! for the next start to trip over. This future resolves on SIGINT or
//! SIGTERM and is handed to `axum::serve().with_graceful_shutdown()` so
//! in-flight uploads finish and teardown runs.

/// Resolves when an OS shutdown signal is received (SIGINT or SIGTERM on
/// Unix), logging which one arrived.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => {
                tracing::info!("SIGINT received, draining uploads and releasing shared memory");
            }
            () = terminate => {
                tracing::info!("SIGTERM received, draining uploads and releasing shared memory");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Ctrl+C received, draining uploads and releasing shared memory");
    }
}
