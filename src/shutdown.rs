use tokio_util::sync::CancellationToken;

/// What ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    Sigterm,
    /// Stdout was closed (e.g. piped into `head`)
    OutputClosed,
    /// The pod watch stopped delivering events
    WatchEnded,
}

/// Cancel `token` on Ctrl-C or SIGTERM, whichever comes first. Resolves with
/// `None` if the token is cancelled for some other reason.
pub async fn cancel_on_signal(token: CancellationToken) -> Option<ShutdownReason> {
    let reason = tokio::select! {
        _ = token.cancelled() => return None,
        _ = tokio::signal::ctrl_c() => ShutdownReason::CtrlC,
        _ = sigterm() => ShutdownReason::Sigterm,
    };

    token.cancel();
    Some(reason)
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        // Could not register: never fire
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_returns_when_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn(cancel_on_signal(token.clone()));

        token.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, None);
    }
}
