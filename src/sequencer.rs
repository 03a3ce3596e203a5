//! Post-loop shutdown sequence.
//!
//! Runs exactly once after the work loop returns, whatever the reason:
//! 1. flush telemetry and stdout
//! 2. heartbeat grace period
//! 3. cancel and join the shutdown file watcher (bounded)
//! 4. release remaining resources in reverse acquisition order
//!
//! Every step is attempted even if an earlier one failed. Failures are
//! logged and recorded in the report, never propagated.

use crate::telemetry::{Severity, TelemetrySink};
use crate::watcher::{WatcherHandle, WatcherState};
use std::io::Write;
use std::time::Duration;

type Release = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// Resources to release at shutdown, in acquisition order.
#[derive(Default)]
pub struct ResourceStack {
    entries: Vec<(String, Release)>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Later pushes are released first.
    pub fn push<F>(&mut self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.entries.push((name.into(), Box::new(release)));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Release everything, newest first. Returns the names that failed.
    fn release_all(self) -> (Vec<String>, Vec<String>) {
        let mut released = Vec::new();
        let mut failed = Vec::new();
        for (name, release) in self.entries.into_iter().rev() {
            match release() {
                Ok(()) => {
                    tracing::debug!(resource = %name, "released");
                    released.push(name);
                }
                Err(e) => {
                    tracing::warn!(resource = %name, error = %e, "failed to release resource");
                    failed.push(name);
                }
            }
        }
        (released, failed)
    }
}

/// Timing knobs for the sequence.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub heartbeat_count: u32,
    pub heartbeat_interval: Duration,
    pub watcher_join_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            heartbeat_count: 30,
            heartbeat_interval: Duration::from_secs(1),
            watcher_join_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub flushed: bool,
    pub heartbeats: u32,
    /// Final watcher state, or `None` if joining it failed or timed out.
    pub watcher: Option<WatcherState>,
    /// Resource names, in the order they were released.
    pub released: Vec<String>,
    pub failed_releases: Vec<String>,
}

impl ShutdownReport {
    /// Every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.flushed && self.watcher.is_some() && self.failed_releases.is_empty()
    }
}

pub struct ShutdownSequencer {
    config: SequencerConfig,
}

impl ShutdownSequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self { config }
    }

    /// Run the whole sequence. Consumes the watcher and the resources so it
    /// cannot run twice.
    pub async fn run(
        self,
        telemetry: &dyn TelemetrySink,
        watcher: WatcherHandle,
        resources: ResourceStack,
    ) -> ShutdownReport {
        tracing::info!("shutdown sequence started");

        // 1. Flush
        let flushed = match telemetry.flush() {
            Ok(written) => {
                tracing::info!(records = written, "telemetry flushed");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "telemetry flush failed");
                false
            }
        };
        if let Err(e) = std::io::stdout().flush() {
            tracing::warn!(error = %e, "stdout flush failed");
        }

        // 2. Heartbeat
        let heartbeats = self.heartbeat(telemetry).await;

        // 3. Watcher
        let watcher = match watcher.shutdown(self.config.watcher_join_timeout).await {
            Ok(state) => {
                tracing::info!(state = ?state, "shutdown file watcher stopped");
                telemetry.track_trace(Severity::Verbose, &format!("watcher stopped: {state:?}"));
                Some(state)
            }
            Err(e) => {
                tracing::warn!(error = %e, "proceeding without shutdown file watcher");
                telemetry.track_trace(Severity::Warning, &e.to_string());
                None
            }
        };

        // 4. Resources
        let (released, failed_releases) = resources.release_all();

        tracing::info!(
            heartbeats,
            released = released.len(),
            failed = failed_releases.len(),
            "shutdown sequence complete"
        );
        ShutdownReport {
            flushed,
            heartbeats,
            watcher,
            released,
            failed_releases,
        }
    }

    /// Emit exactly `heartbeat_count` heartbeat lines.
    async fn heartbeat(&self, telemetry: &dyn TelemetrySink) -> u32 {
        let total = self.config.heartbeat_count;
        let mut emitted = 0;
        for n in 1..=total {
            tracing::info!(heartbeat = n, of = total, "still shutting down");
            telemetry.track_trace(
                Severity::Information,
                &format!("still shutting down ({n}/{total})"),
            );
            emitted += 1;
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
        emitted
    }
}
