//! The periodic work loop.
//!
//! Checks the exit state before every iteration, runs one unit of work to
//! completion, then waits for the tick interval or a stop request, whichever
//! comes first. A failing iteration ends the loop (fail-stop).

use crate::coordinator::{ExitCoordinator, StopOrigin, StopRequest};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// One iteration of delegated work.
pub trait UnitOfWork {
    fn run_once(&mut self, iteration: u64)
        -> impl Future<Output = Result<(), WorkError>> + Send;
}

/// Errors raised by a unit of work.
#[derive(Debug)]
pub enum WorkError {
    /// Writing the output artifact failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WorkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkError::Io { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for WorkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkError::Io { source, .. } => Some(source),
        }
    }
}

/// How a loop run ended without error.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Iterations that ran to completion.
    pub iterations: u64,
    /// The stop request that ended the loop.
    pub stop: Option<StopRequest>,
}

/// A loop run that ended because an iteration failed.
#[derive(Debug)]
pub struct LoopError {
    /// Iterations that completed before the failing one.
    pub iterations: u64,
    pub source: WorkError,
}

impl std::fmt::Display for LoopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "iteration {} failed: {}",
            self.iterations + 1,
            self.source
        )
    }
}

impl std::error::Error for LoopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub struct WorkLoop {
    coordinator: ExitCoordinator,
    tick_interval: Duration,
    max_iterations: Option<u64>,
}

impl WorkLoop {
    pub fn new(coordinator: ExitCoordinator, tick_interval: Duration) -> Self {
        Self {
            coordinator,
            tick_interval,
            max_iterations: None,
        }
    }

    /// Stop after this many iterations.
    pub fn with_max_iterations(mut self, max_iterations: Option<u64>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub async fn run<W: UnitOfWork>(&self, work: &mut W) -> Result<LoopOutcome, LoopError> {
        let mut iterations = 0u64;
        tracing::info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            max_iterations = ?self.max_iterations,
            "work loop started"
        );

        loop {
            if self.coordinator.should_exit() {
                break;
            }
            if self.limit_reached(iterations) {
                self.coordinator.request_exit(StopOrigin::IterationLimit);
                break;
            }

            if let Err(e) = work.run_once(iterations + 1).await {
                tracing::error!(
                    error = %e,
                    iteration = iterations + 1,
                    "work iteration failed, stopping loop"
                );
                return Err(LoopError {
                    iterations,
                    source: e,
                });
            }
            iterations += 1;
            if self.limit_reached(iterations) {
                continue;
            }

            tokio::select! {
                _ = self.coordinator.stopped() => {}
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }

        let stop = self.coordinator.stop_request();
        tracing::info!(
            iterations,
            origin = ?stop.as_ref().map(|s| s.origin.to_string()),
            "work loop stopped"
        );
        Ok(LoopOutcome { iterations, stop })
    }

    fn limit_reached(&self, iterations: u64) -> bool {
        self.max_iterations.is_some_and(|max| iterations >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Records each iteration; optionally fails or requests exit mid-iteration.
    struct ScriptedWork {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<u64>,
        stop_during: Option<(u64, ExitCoordinator)>,
    }

    impl ScriptedWork {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                fail_on: None,
                stop_during: None,
            }
        }
    }

    impl UnitOfWork for ScriptedWork {
        async fn run_once(&mut self, iteration: u64) -> Result<(), WorkError> {
            if self.fail_on == Some(iteration) {
                return Err(WorkError::Io {
                    path: PathBuf::from("scripted"),
                    source: std::io::Error::other(format!("scripted failure at {iteration}")),
                });
            }
            self.log.lock().unwrap().push(format!("begin {iteration}"));
            if let Some((at, coordinator)) = &self.stop_during {
                if *at == iteration {
                    coordinator.request_exit(StopOrigin::Interrupt);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.log.lock().unwrap().push(format!("end {iteration}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_iteration_when_already_stopped() {
        let coordinator = ExitCoordinator::new();
        coordinator.request_exit(StopOrigin::Terminate);

        let mut work = ScriptedWork::new();
        let outcome = WorkLoop::new(coordinator, Duration::from_millis(5))
            .run(&mut work)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 0);
        assert!(work.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_mid_iteration_completes_it_and_starts_no_more() {
        let coordinator = ExitCoordinator::new();
        let mut work = ScriptedWork::new();
        work.stop_during = Some((2, coordinator.clone()));

        let outcome = WorkLoop::new(coordinator, Duration::from_millis(5))
            .run(&mut work)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.stop.unwrap().origin, StopOrigin::Interrupt);
        assert_eq!(
            *work.log.lock().unwrap(),
            vec!["begin 1", "end 1", "begin 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn test_failure_stops_loop() {
        let coordinator = ExitCoordinator::new();
        let mut work = ScriptedWork::new();
        work.fail_on = Some(3);

        let err = WorkLoop::new(coordinator.clone(), Duration::from_millis(1))
            .run(&mut work)
            .await
            .unwrap_err();

        assert_eq!(err.iterations, 2);
        assert!(err.source.to_string().contains("scripted failure at 3"));
        assert!(err.to_string().contains("iteration 3 failed"));
        // A work failure is not a stop request.
        assert!(!coordinator.should_exit());
    }

    #[tokio::test]
    async fn test_max_iterations_requests_exit() {
        let coordinator = ExitCoordinator::new();
        let mut work = ScriptedWork::new();

        let outcome = WorkLoop::new(coordinator.clone(), Duration::from_millis(1))
            .with_max_iterations(Some(4))
            .run(&mut work)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 4);
        assert_eq!(
            coordinator.stop_request().unwrap().origin,
            StopOrigin::IterationLimit
        );
    }

    #[tokio::test]
    async fn test_zero_max_iterations_runs_no_work() {
        let coordinator = ExitCoordinator::new();
        let mut work = ScriptedWork::new();

        let outcome = WorkLoop::new(coordinator.clone(), Duration::from_millis(1))
            .with_max_iterations(Some(0))
            .run(&mut work)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 0);
        assert!(work.log.lock().unwrap().is_empty());
        assert_eq!(outcome.stop.unwrap().origin, StopOrigin::IterationLimit);
    }

    #[tokio::test]
    async fn test_limit_stops_without_waiting_a_tick() {
        let coordinator = ExitCoordinator::new();
        let mut work = ScriptedWork::new();

        let start = Instant::now();
        let outcome = WorkLoop::new(coordinator, Duration::from_secs(30))
            .with_max_iterations(Some(1))
            .run(&mut work)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_is_interrupted_by_stop() {
        let coordinator = ExitCoordinator::new();
        let mut work = ScriptedWork::new();

        let stopper = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                coordinator.request_exit(StopOrigin::Terminate);
            })
        };

        let start = Instant::now();
        let outcome = WorkLoop::new(coordinator, Duration::from_secs(30))
            .run(&mut work)
            .await
            .unwrap();
        stopper.await.unwrap();

        assert_eq!(outcome.iterations, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
