//! Process root: wires configuration, collaborators and the shutdown
//! machinery together, and maps the result to an exit status.

use crate::config::WorkerConfig;
use crate::coordinator::{ExitCoordinator, StopRequest};
use crate::data_dir::DataDir;
use crate::sequencer::{ResourceStack, ShutdownReport, ShutdownSequencer};
use crate::telemetry::{Severity, SpoolTelemetry, TelemetryError, TelemetrySink};
use crate::timestamp::TimestampWriter;
use crate::watcher::ShutdownFileWatcher;
use crate::work_loop::{LoopError, WorkLoop};
use std::path::PathBuf;
use std::sync::Arc;

/// How a worker run ended.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub iterations: u64,
    pub stop: Option<StopRequest>,
    pub shutdown: ShutdownReport,
}

#[derive(Debug)]
pub enum WorkerError {
    /// The output directory could not be created.
    Bootstrap {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The telemetry client could not be built.
    Telemetry { source: TelemetryError },
    /// An iteration failed. The shutdown sequence still ran.
    Work {
        source: LoopError,
        shutdown: ShutdownReport,
    },
    /// The work task panicked. The shutdown sequence still ran.
    Panicked {
        message: String,
        shutdown: ShutdownReport,
    },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Bootstrap { path, source } => {
                write!(
                    f,
                    "failed to create output directory {}: {}",
                    path.display(),
                    source
                )
            }
            WorkerError::Telemetry { source } => write!(f, "telemetry setup failed: {}", source),
            WorkerError::Work { source, .. } => write!(f, "{}", source),
            WorkerError::Panicked { message, .. } => {
                write!(f, "work task panicked: {}", message)
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Bootstrap { source, .. } => Some(source),
            WorkerError::Telemetry { source } => Some(source),
            WorkerError::Work { source, .. } => Some(source),
            WorkerError::Panicked { .. } => None,
        }
    }
}

impl WorkerError {
    /// The shutdown report, for errors raised after the loop started.
    pub fn shutdown_report(&self) -> Option<&ShutdownReport> {
        match self {
            WorkerError::Work { shutdown, .. } | WorkerError::Panicked { shutdown, .. } => {
                Some(shutdown)
            }
            WorkerError::Bootstrap { .. } | WorkerError::Telemetry { .. } => None,
        }
    }

    /// Startup failures happen before the loop; everything else after.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            WorkerError::Bootstrap { .. } | WorkerError::Telemetry { .. }
        )
    }
}

pub struct Worker {
    config: WorkerConfig,
    coordinator: ExitCoordinator,
    resources: ResourceStack,
}

impl Worker {
    /// `config` must already have passed `WorkerConfig::validate`.
    pub fn new(config: WorkerConfig, coordinator: ExitCoordinator) -> Self {
        Self {
            config,
            coordinator,
            resources: ResourceStack::new(),
        }
    }

    /// Register something acquired before the worker (e.g. signal listeners)
    /// so the shutdown sequence releases it.
    pub fn with_resource<F>(mut self, name: &str, release: F) -> Self
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.resources.push(name, release);
        self
    }

    pub async fn run(self) -> Result<WorkerOutcome, WorkerError> {
        let Worker {
            config,
            coordinator,
            mut resources,
        } = self;

        let data_dir = DataDir::new(&config.work.output_dir, config.work.output_file.as_str());
        data_dir.init().map_err(|e| WorkerError::Bootstrap {
            path: data_dir.root().to_path_buf(),
            source: e,
        })?;

        let connection = config.telemetry.connection_string.as_deref().unwrap_or_default();
        let telemetry = Arc::new(
            SpoolTelemetry::from_connection_string(connection, &data_dir.telemetry_spool())
                .map_err(|e| WorkerError::Telemetry { source: e })?,
        );
        {
            let telemetry = telemetry.clone();
            resources.push("telemetry client", move || {
                telemetry.close().map_err(|e| e.to_string())
            });
        }

        let watcher = ShutdownFileWatcher::new(
            config.shutdown.shutdown_file.clone(),
            config.poll_interval(),
        )
        .start(coordinator.clone());
        tracing::debug!(state = ?watcher.state(), "shutdown file watcher started");

        let output = data_dir.output_file();
        tracing::info!(output = %output.display(), "worker started");
        let work_loop = WorkLoop::new(coordinator.clone(), config.tick_interval())
            .with_max_iterations(config.work.max_iterations);
        let sink: Arc<dyn TelemetrySink> = telemetry.clone();
        let mut writer = TimestampWriter::new(output, sink);

        // The loop runs on its own task so a panic in the work step still
        // reaches the shutdown sequence below.
        let loop_task = tokio::spawn(async move { work_loop.run(&mut writer).await });
        let loop_result = loop_task.await;
        match &loop_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => telemetry.track_trace(Severity::Error, &e.to_string()),
            Err(e) => telemetry.track_trace(Severity::Critical, &format!("work task panicked: {e}")),
        }

        let shutdown = ShutdownSequencer::new(config.sequencer())
            .run(telemetry.as_ref(), watcher, resources)
            .await;

        match loop_result {
            Ok(Ok(outcome)) => Ok(WorkerOutcome {
                iterations: outcome.iterations,
                stop: outcome.stop,
                shutdown,
            }),
            Ok(Err(source)) => Err(WorkerError::Work { source, shutdown }),
            Err(join) => Err(WorkerError::Panicked {
                message: join.to_string(),
                shutdown,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::StopOrigin;
    use crate::watcher::WatcherState;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.work.output_dir = dir.join("out");
        config.shutdown.heartbeat_count = 2;
        config.shutdown.heartbeat_interval_secs = 0;
        config.telemetry.connection_string = Some("InstrumentationKey=test".to_string());
        config
    }

    #[tokio::test]
    async fn test_runs_until_iteration_limit() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.work.max_iterations = Some(2);

        let outcome = Worker::new(config, ExitCoordinator::new())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.stop.unwrap().origin, StopOrigin::IterationLimit);
        assert_eq!(outcome.shutdown.heartbeats, 2);
        assert_eq!(outcome.shutdown.watcher, Some(WatcherState::Disabled));
        assert_eq!(outcome.shutdown.released, vec!["telemetry client"]);

        let lines = std::fs::read_to_string(dir.path().join("out/timestamps.txt")).unwrap();
        assert_eq!(lines.lines().count(), 2);

        // Traces, metrics and heartbeats all reached the spool.
        let spool = std::fs::read_to_string(dir.path().join("out/telemetry.jsonl")).unwrap();
        assert!(spool.lines().count() >= 6);
    }

    #[tokio::test]
    async fn test_stop_from_shutdown_file() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("shutdown");
        std::fs::write(&marker, "").unwrap();
        let mut config = test_config(dir.path());
        config.shutdown.shutdown_file = Some(marker);

        let outcome = Worker::new(config, ExitCoordinator::new())
            .run()
            .await
            .unwrap();

        // The marker was present before the loop started.
        assert_eq!(outcome.iterations, 0);
        assert_eq!(
            outcome.stop.unwrap().origin,
            StopOrigin::ShutdownFilePresent
        );
        assert_eq!(
            outcome.shutdown.watcher,
            Some(WatcherState::AlreadyTriggered)
        );
    }

    #[tokio::test]
    async fn test_extra_resources_released_after_worker_resources() {
        let dir = tempdir().unwrap();
        let coordinator = ExitCoordinator::new();
        coordinator.request_exit(StopOrigin::Terminate);

        let outcome = Worker::new(test_config(dir.path()), coordinator)
            .with_resource("signal listeners", || Ok(()))
            .run()
            .await
            .unwrap();

        assert_eq!(
            outcome.shutdown.released,
            vec!["telemetry client", "signal listeners"]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_startup_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut config = test_config(dir.path());
        config.work.output_dir = blocker;

        let err = Worker::new(config, ExitCoordinator::new())
            .run()
            .await
            .unwrap_err();
        assert!(err.is_startup());
        assert!(matches!(err, WorkerError::Bootstrap { .. }));
    }

    #[tokio::test]
    async fn test_bad_connection_string_is_startup_error() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.telemetry.connection_string = Some("Endpoint=nowhere".to_string());

        let err = Worker::new(config, ExitCoordinator::new())
            .run()
            .await
            .unwrap_err();
        assert!(err.is_startup());
    }
}
