use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Turns SIGTERM/SIGINT into a [`CancellationToken`] shared by the HTTP server
/// and the background tasks of the engine (sweeper, device reconnects).
pub struct SigDown {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    /// Registers the signal handlers and spawns the listener task.
    ///
    /// Returns an error if signal registration fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let cancellation_token = CancellationToken::new();
        let trigger = cancellation_token.clone();
        let task_tracker = TaskTracker::new();
        task_tracker.spawn(async move {
            let received = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = trigger.cancelled() => return,
            };
            tracing::info!(signal = received, "Shutdown requested");
            trigger.cancel();
        });
        task_tracker.close();
        Ok(Self {
            task_tracker,
            cancellation_token,
        })
    }

    /// Returns a clone of the cancellation token for distributing to subsystems.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Future suitable for `axum::serve(..).with_graceful_shutdown`.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.cancellation_token.clone();
        async move { token.cancelled().await }
    }

    /// Waits until shutdown was requested and the listener task has finished.
    pub async fn recv(&self) {
        self.cancellation_token.cancelled().await;
        self.task_tracker.wait().await;
    }
}
