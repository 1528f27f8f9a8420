use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and SIGINT.
///
/// The returned token is cancelled when either signal arrives. Cancelling it
/// only tells the controller to stop waiting; submitted jobs keep running and
/// their snapshots stay on disk for `recover`.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let received = wait_for_signal().await;
        tracing::info!(signal = received, "Received shutdown signal");
        trigger.cancel();
    });

    token
}

async fn wait_for_signal() -> &'static str {
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            }
        }
        _ => {
            tracing::warn!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}
