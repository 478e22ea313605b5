use std::future::Future;

use tokio::signal;
use tracing::{error, info};

/// Resolves on Ctrl+C (SIGINT) or SIGTERM.
///
/// Handlers are installed when this is called, not when the future is first
/// polled, so a signal that arrives while the service is still starting is
/// observed once the caller begins waiting.
pub fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    #[cfg(unix)]
    {
        use signal::unix::SignalKind;

        let interrupt = install(SignalKind::interrupt(), "SIGINT");
        let terminate = install(SignalKind::terminate(), "SIGTERM");
        async move {
            tokio::select! {
                () = recv_or_pending(interrupt) => info!("received Ctrl+C"),
                () = recv_or_pending(terminate) => info!("received SIGTERM"),
            }
        }
    }

    #[cfg(not(unix))]
    async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C");
    }
}

#[cfg(unix)]
fn install(kind: signal::unix::SignalKind, name: &str) -> Option<signal::unix::Signal> {
    match signal::unix::signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            error!(error = %e, signal = name, "failed to install signal handler");
            None
        }
    }
}

#[cfg(unix)]
async fn recv_or_pending(stream: Option<signal::unix::Signal>) {
    match stream {
        Some(mut stream) => {
            stream.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sigterm_before_first_poll_is_observed() {
        let shutdown = shutdown_signal();

        let sent = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(sent.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("SIGTERM was not observed");
    }
}
