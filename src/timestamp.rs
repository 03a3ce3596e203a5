//! The worker's unit of work: append one timestamp line per iteration and
//! report it to telemetry.

use crate::telemetry::{Severity, TelemetrySink};
use crate::work_loop::{UnitOfWork, WorkError};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

pub struct TimestampWriter {
    path: PathBuf,
    telemetry: Arc<dyn TelemetrySink>,
    written: u64,
}

impl TimestampWriter {
    pub fn new(path: PathBuf, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            path,
            telemetry,
            written: 0,
        }
    }

    /// Lines written by this writer so far.
    #[cfg(test)]
    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    fn append_line(&self, line: &str) -> Result<(), WorkError> {
        let io_err = |e| WorkError::Io {
            path: self.path.clone(),
            source: e,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        // A single write_all of the whole line keeps lines intact in append mode.
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(())
    }
}

impl UnitOfWork for TimestampWriter {
    async fn run_once(&mut self, iteration: u64) -> Result<(), WorkError> {
        let now = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.append_line(&format!("{now}\n"))?;
        self.written += 1;

        tracing::info!(iteration, timestamp = %now, "wrote timestamp");
        self.telemetry
            .track_trace(Severity::Information, &format!("timestamp written: {now}"));
        self.telemetry
            .track_metric("timestamps_written", self.written as f64);
        Ok(())
    }
}
