use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The node stops its conductor when the token fires and lets in-flight
/// executions resolve before closing the board.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping conductor");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping conductor");
            }
        }

        trigger.cancel();
    });

    token
}
