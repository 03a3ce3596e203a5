//! Signal handling for graceful shutdown.
//!
//! Each OS notification gets its own listener task that forwards every
//! delivery to the exit coordinator:
//! - SIGINT (Ctrl-C) -> interrupt
//! - SIGTERM -> terminate
//! - SIGHUP -> hangup (the session or process-exit notice)
//! - SIGQUIT -> quit
//!
//! Registering a listener replaces the default kill disposition, so the
//! coordinator always gets a chance to run. The listeners do not coordinate
//! with each other; the coordinator's first-request-wins rule makes that safe.

use crate::coordinator::{ExitCoordinator, StopOrigin};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// The installed signal listeners.
pub struct SignalSource {
    listeners: Vec<JoinHandle<()>>,
}

impl SignalSource {
    /// Install all listeners. Only the first call in a process installs
    /// anything; later calls return an empty source.
    pub fn install(coordinator: &ExitCoordinator) -> Self {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            tracing::debug!("signal handlers already installed");
            return Self {
                listeners: Vec::new(),
            };
        }

        let listeners = install_listeners(coordinator);
        tracing::info!(count = listeners.len(), "signal handlers installed");
        Self { listeners }
    }

    /// Number of active listener tasks.
    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Stop listening.
    ///
    /// The process-level handlers stay registered, so the default action is
    /// not restored: later deliveries of these signals are swallowed.
    pub fn shutdown(self) {
        for listener in self.listeners {
            listener.abort();
        }
    }
}

#[cfg(unix)]
fn install_listeners(coordinator: &ExitCoordinator) -> Vec<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let kinds = [
        (SignalKind::interrupt(), StopOrigin::Interrupt, "SIGINT"),
        (SignalKind::terminate(), StopOrigin::Terminate, "SIGTERM"),
        (SignalKind::hangup(), StopOrigin::Hangup, "SIGHUP"),
        (SignalKind::quit(), StopOrigin::Quit, "SIGQUIT"),
    ];

    let mut listeners = Vec::new();
    for (kind, origin, name) in kinds {
        // A failed registration only loses that one source; the others and
        // the shutdown file watcher still work.
        let mut stream = match signal(kind) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(signal = name, error = %e, "failed to register signal handler");
                continue;
            }
        };
        let coordinator = coordinator.clone();
        listeners.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::info!(signal = name, "signal received");
                coordinator.request_exit(origin);
            }
        }));
    }
    listeners
}

#[cfg(not(unix))]
fn install_listeners(coordinator: &ExitCoordinator) -> Vec<JoinHandle<()>> {
    let coordinator = coordinator.clone();
    vec![tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                return;
            }
            tracing::info!(signal = "ctrl-c", "signal received");
            coordinator.request_exit(StopOrigin::Interrupt);
        }
    })]
}
