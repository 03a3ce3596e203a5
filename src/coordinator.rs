//! Exit coordination: the single authoritative "should stop" state.
//!
//! Every stop source (signal adapters, the shutdown file watcher, the
//! iteration limit) calls `request_exit`. The first request wins and is
//! recorded; every later request is a logged no-op. The state only ever
//! moves from "continue" to "stop".

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// The channel through which a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOrigin {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM, the host's managed shutdown notice.
    Terminate,
    /// SIGHUP, the session or process-exit notice.
    Hangup,
    /// SIGQUIT.
    Quit,
    /// The shutdown marker file already existed when the watcher started.
    ShutdownFilePresent,
    /// The shutdown marker file appeared while the watcher was polling.
    ShutdownFileDetected,
    /// The configured iteration limit was reached.
    IterationLimit,
}

impl fmt::Display for StopOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopOrigin::Interrupt => "interrupt",
            StopOrigin::Terminate => "terminate",
            StopOrigin::Hangup => "hangup",
            StopOrigin::Quit => "quit",
            StopOrigin::ShutdownFilePresent => "shutdown-file-present",
            StopOrigin::ShutdownFileDetected => "shutdown-file-detected",
            StopOrigin::IterationLimit => "iteration-limit",
        };
        f.write_str(name)
    }
}

/// A recorded stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub origin: StopOrigin,
    pub requested_at: DateTime<Utc>,
}

/// Shared, cloneable handle to the exit state.
///
/// The state lives in a `watch` channel: writes go through its internal
/// lock (so concurrent requests are linearized) and readers can either poll
/// `should_exit` or await `stopped`.
#[derive(Clone)]
pub struct ExitCoordinator {
    state: Arc<watch::Sender<Option<StopRequest>>>,
}

impl Default for ExitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Request process exit.
    ///
    /// Returns `true` if this call made the transition, `false` if a stop
    /// had already been requested.
    pub fn request_exit(&self, origin: StopOrigin) -> bool {
        let mut winner = None;
        let transitioned = self.state.send_if_modified(|state| match state {
            Some(existing) => {
                winner = Some(existing.origin);
                false
            }
            None => {
                *state = Some(StopRequest {
                    origin,
                    requested_at: Utc::now(),
                });
                true
            }
        });

        if transitioned {
            tracing::info!(origin = %origin, "exit requested");
        } else if let Some(first) = winner {
            tracing::debug!(
                origin = %origin,
                first_origin = %first,
                "exit already requested, ignoring"
            );
        }
        transitioned
    }

    /// Non-blocking check of the exit state.
    pub fn should_exit(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// The request that won, if any.
    pub fn stop_request(&self) -> Option<StopRequest> {
        self.state.borrow().clone()
    }

    /// Resolves once a stop has been requested. Returns immediately if one
    /// already has been.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(Option::is_some).await;
    }
}
