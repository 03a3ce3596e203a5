//! Shutdown marker file watcher.
//!
//! Some hosts stop a worker by creating a well-known file rather than
//! sending a signal. The watcher polls for that file in the background and
//! requests exit when it appears, so the work loop never has to know about it.

use crate::coordinator::{ExitCoordinator, StopOrigin};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Existence check used by the watcher.
pub type ExistsCheck = fn(&Path) -> std::io::Result<bool>;

/// Where the watcher ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No marker path configured.
    Disabled,
    /// The marker existed at startup; no background task was spawned.
    AlreadyTriggered,
    /// The background task is (or was, until joined) polling.
    Polling,
    /// The marker appeared while polling.
    Triggered,
    /// The task was canceled before the marker appeared.
    Canceled,
}

/// Errors from joining the background task.
#[derive(Debug)]
pub enum WatcherError {
    /// The task did not finish within the join timeout.
    JoinTimeout { timeout: Duration },
    /// The task panicked or was aborted.
    Join { source: tokio::task::JoinError },
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::JoinTimeout { timeout } => {
                write!(
                    f,
                    "shutdown file watcher did not stop within {}ms",
                    timeout.as_millis()
                )
            }
            WatcherError::Join { source } => {
                write!(f, "shutdown file watcher task failed: {}", source)
            }
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::JoinTimeout { .. } => None,
            WatcherError::Join { source } => Some(source),
        }
    }
}

/// Configuration for the marker file watcher.
pub struct ShutdownFileWatcher {
    path: Option<PathBuf>,
    poll_interval: Duration,
    exists: ExistsCheck,
}

impl ShutdownFileWatcher {
    pub fn new(path: Option<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            exists: Path::try_exists,
        }
    }

    /// Replace the existence check to simulate I/O failures.
    #[cfg(test)]
    pub(crate) fn with_exists_check(mut self, exists: ExistsCheck) -> Self {
        self.exists = exists;
        self
    }

    /// Start watching.
    ///
    /// If the marker already exists, exit is requested right away and no
    /// task is spawned.
    pub fn start(self, coordinator: ExitCoordinator) -> WatcherHandle {
        let token = CancellationToken::new();

        let Some(path) = self.path else {
            tracing::info!("no shutdown file configured, watcher disabled");
            return WatcherHandle::idle(token, WatcherState::Disabled);
        };

        match (self.exists)(&path) {
            Ok(true) => {
                tracing::info!(path = %path.display(), "shutdown file already present");
                coordinator.request_exit(StopOrigin::ShutdownFilePresent);
                return WatcherHandle::idle(token, WatcherState::AlreadyTriggered);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to check shutdown file, will retry"
                );
            }
        }

        tracing::info!(
            path = %path.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "watching for shutdown file"
        );
        let task = tokio::spawn(poll_for_marker(
            path,
            self.poll_interval,
            self.exists,
            coordinator,
            token.clone(),
        ));
        WatcherHandle::polling(token, task)
    }
}

async fn poll_for_marker(
    path: PathBuf,
    poll_interval: Duration,
    exists: ExistsCheck,
    coordinator: ExitCoordinator,
    token: CancellationToken,
) -> WatcherState {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; start() already checked once.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("shutdown file watcher canceled");
                return WatcherState::Canceled;
            }
            _ = ticker.tick() => {}
        }

        match exists(&path) {
            Ok(true) => {
                tracing::info!(path = %path.display(), "shutdown file detected");
                coordinator.request_exit(StopOrigin::ShutdownFileDetected);
                return WatcherState::Triggered;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to check shutdown file, will retry"
                );
            }
        }
    }
}

/// Handle to the watcher: a cancellation token and, while polling, the task.
pub struct WatcherHandle {
    token: CancellationToken,
    task: Option<JoinHandle<WatcherState>>,
    state: WatcherState,
}

impl WatcherHandle {
    fn idle(token: CancellationToken, state: WatcherState) -> Self {
        Self {
            token,
            task: None,
            state,
        }
    }

    pub(crate) fn polling(token: CancellationToken, task: JoinHandle<WatcherState>) -> Self {
        Self {
            token,
            task: Some(task),
            state: WatcherState::Polling,
        }
    }

    /// State at the time `start` returned.
    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Whether a background task was spawned.
    #[cfg(test)]
    pub(crate) fn is_polling(&self) -> bool {
        self.task.is_some()
    }

    /// Cancel the background task and wait for it, at most `timeout`.
    ///
    /// On timeout the task is left to die with the runtime.
    pub async fn shutdown(self, timeout: Duration) -> Result<WatcherState, WatcherError> {
        self.token.cancel();
        let Some(task) = self.task else {
            return Ok(self.state);
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(source)) => Err(WatcherError::Join { source }),
            Err(_) => Err(WatcherError::JoinTimeout { timeout }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const FAST: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_disabled_without_path() {
        let coordinator = ExitCoordinator::new();
        let handle = ShutdownFileWatcher::new(None, FAST).start(coordinator.clone());

        assert_eq!(handle.state(), WatcherState::Disabled);
        assert!(!handle.is_polling());
        assert_eq!(
            handle.shutdown(FAST).await.unwrap(),
            WatcherState::Disabled
        );
        assert!(!coordinator.should_exit());
    }

    #[tokio::test]
    async fn test_marker_present_at_start_requests_exit_without_task() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("shutdown");
        std::fs::write(&marker, "").unwrap();

        let coordinator = ExitCoordinator::new();
        let handle = ShutdownFileWatcher::new(Some(marker), FAST).start(coordinator.clone());

        assert_eq!(handle.state(), WatcherState::AlreadyTriggered);
        assert!(!handle.is_polling());
        assert_eq!(
            coordinator.stop_request().unwrap().origin,
            StopOrigin::ShutdownFilePresent
        );
    }

    #[tokio::test]
    async fn test_marker_created_later_is_detected() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("shutdown");

        let coordinator = ExitCoordinator::new();
        let handle =
            ShutdownFileWatcher::new(Some(marker.clone()), FAST).start(coordinator.clone());
        assert!(handle.is_polling());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!coordinator.should_exit());
        std::fs::write(&marker, "").unwrap();

        // One poll interval plus generous scheduling slack.
        tokio::time::timeout(Duration::from_secs(2), coordinator.stopped())
            .await
            .expect("marker was not detected");
        assert_eq!(
            coordinator.stop_request().unwrap().origin,
            StopOrigin::ShutdownFileDetected
        );
        assert_eq!(
            handle.shutdown(Duration::from_secs(1)).await.unwrap(),
            WatcherState::Triggered
        );
    }

    #[tokio::test]
    async fn test_cancel_without_marker_stops_promptly() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("never-created");

        let coordinator = ExitCoordinator::new();
        let handle = ShutdownFileWatcher::new(Some(marker), Duration::from_millis(200))
            .start(coordinator.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = handle.shutdown(Duration::from_millis(200)).await.unwrap();

        assert_eq!(state, WatcherState::Canceled);
        assert!(!coordinator.should_exit());
    }

    static FLAKY_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn flaky_exists(_path: &Path) -> std::io::Result<bool> {
        // Startup check and the first two polls fail, then the file "appears".
        match FLAKY_CALLS.fetch_add(1, Ordering::SeqCst) {
            0..=2 => Err(std::io::Error::other("transient stat failure")),
            _ => Ok(true),
        }
    }

    #[tokio::test]
    async fn test_check_errors_do_not_stop_polling() {
        let coordinator = ExitCoordinator::new();
        let handle = ShutdownFileWatcher::new(Some(PathBuf::from("/flaky/marker")), FAST)
            .with_exists_check(flaky_exists)
            .start(coordinator.clone());
        assert!(handle.is_polling());

        tokio::time::timeout(Duration::from_secs(2), coordinator.stopped())
            .await
            .expect("watcher gave up after failed checks");
        assert!(FLAKY_CALLS.load(Ordering::SeqCst) >= 4);
        assert_eq!(
            handle.shutdown(Duration::from_secs(1)).await.unwrap(),
            WatcherState::Triggered
        );
    }

    fn always_failing(_path: &Path) -> std::io::Result<bool> {
        Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
    }

    #[tokio::test]
    async fn test_failed_startup_check_falls_through_to_polling() {
        let coordinator = ExitCoordinator::new();
        let handle = ShutdownFileWatcher::new(Some(PathBuf::from("/denied/marker")), FAST)
            .with_exists_check(always_failing)
            .start(coordinator.clone());

        assert_eq!(handle.state(), WatcherState::Polling);
        assert!(handle.is_polling());

        // A few failed polls go by without requesting exit.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!coordinator.should_exit());
        assert_eq!(
            handle.shutdown(Duration::from_secs(1)).await.unwrap(),
            WatcherState::Canceled
        );
    }

    #[tokio::test]
    async fn test_join_timeout_is_reported() {
        let token = CancellationToken::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            WatcherState::Canceled
        });
        let handle = WatcherHandle::polling(token, task);

        let err = handle.shutdown(FAST).await.unwrap_err();
        assert!(matches!(err, WatcherError::JoinTimeout { .. }));
        assert!(err.to_string().contains("did not stop"));
    }
}
