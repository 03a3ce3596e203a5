//! Telemetry sink: buffered trace and metric records, spooled to a local
//! JSONL file on flush.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Trace severity, in the order sinks usually rank them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Verbose,
    Information,
    Warning,
    Error,
    Critical,
}

/// Interface the worker uses to emit telemetry.
///
/// `flush` is synchronous: when it returns, every record tracked before the
/// call has been handed to the backing store (or the error says why not).
pub trait TelemetrySink: Send + Sync {
    fn track_trace(&self, severity: Severity, message: &str);
    fn track_metric(&self, name: &str, value: f64);
    /// Deliver buffered records. Returns how many were written.
    fn flush(&self) -> Result<usize, TelemetryError>;
}

#[derive(Debug)]
pub enum TelemetryError {
    /// The connection string could not be parsed.
    ConnectionString { reason: String },
    /// Writing the spool file failed.
    Spool {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A record could not be serialized.
    Serialize { source: serde_json::Error },
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::ConnectionString { reason } => {
                write!(f, "invalid telemetry connection string: {}", reason)
            }
            TelemetryError::Spool { path, source } => {
                write!(
                    f,
                    "failed to write telemetry spool {}: {}",
                    path.display(),
                    source
                )
            }
            TelemetryError::Serialize { source } => {
                write!(f, "failed to serialize telemetry record: {}", source)
            }
        }
    }
}

impl std::error::Error for TelemetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TelemetryError::ConnectionString { .. } => None,
            TelemetryError::Spool { source, .. } => Some(source),
            TelemetryError::Serialize { source } => Some(source),
        }
    }
}

/// Parsed `Key=Value;Key=Value` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub instrumentation_key: String,
    /// Spool file taken from a `file://` ingestion endpoint.
    pub spool_path: Option<PathBuf>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, TelemetryError> {
        let mut instrumentation_key = None;
        let mut spool_path = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(TelemetryError::ConnectionString {
                    reason: format!("expected Key=Value, got '{part}'"),
                });
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "instrumentationkey" => instrumentation_key = Some(value.to_string()),
                "ingestionendpoint" => {
                    let Some(path) = value.strip_prefix("file://") else {
                        return Err(TelemetryError::ConnectionString {
                            reason: format!("only file:// endpoints are supported, got '{value}'"),
                        });
                    };
                    spool_path = Some(PathBuf::from(path));
                }
                // Unknown keys are tolerated so full host strings can be pasted in.
                _ => {}
            }
        }

        match instrumentation_key {
            Some(key) if !key.is_empty() => Ok(Self {
                instrumentation_key: key,
                spool_path,
            }),
            _ => Err(TelemetryError::ConnectionString {
                reason: "missing InstrumentationKey".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Trace {
        time: DateTime<Utc>,
        ikey: String,
        severity: Severity,
        message: String,
    },
    Metric {
        time: DateTime<Utc>,
        ikey: String,
        name: String,
        value: f64,
    },
}

/// File-spooling telemetry client.
pub struct SpoolTelemetry {
    instrumentation_key: String,
    spool_path: PathBuf,
    buffer: Mutex<Vec<Record>>,
}

impl SpoolTelemetry {
    /// Build a client from a connection string. `default_spool` is used when
    /// the connection string names no endpoint.
    pub fn from_connection_string(raw: &str, default_spool: &Path) -> Result<Self, TelemetryError> {
        let parsed = ConnectionString::parse(raw)?;
        let spool_path = parsed
            .spool_path
            .unwrap_or_else(|| default_spool.to_path_buf());
        tracing::info!(spool = %spool_path.display(), "telemetry client ready");
        Ok(Self {
            instrumentation_key: parsed.instrumentation_key,
            spool_path,
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Number of records waiting for the next flush.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Final flush before the client is dropped.
    pub fn close(&self) -> Result<(), TelemetryError> {
        let written = self.flush()?;
        tracing::debug!(written, "telemetry client closed");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        // A panic while holding the lock leaves only a partially built Vec;
        // keep accepting records rather than losing them.
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: Record) {
        self.lock().push(record);
    }
}

impl TelemetrySink for SpoolTelemetry {
    fn track_trace(&self, severity: Severity, message: &str) {
        self.push(Record::Trace {
            time: Utc::now(),
            ikey: self.instrumentation_key.clone(),
            severity,
            message: message.to_string(),
        });
    }

    fn track_metric(&self, name: &str, value: f64) {
        self.push(Record::Metric {
            time: Utc::now(),
            ikey: self.instrumentation_key.clone(),
            name: name.to_string(),
            value,
        });
    }

    fn flush(&self) -> Result<usize, TelemetryError> {
        let records = std::mem::take(&mut *self.lock());
        if records.is_empty() {
            return Ok(0);
        }

        let mut payload = String::new();
        for record in &records {
            let line =
                serde_json::to_string(record).map_err(|e| TelemetryError::Serialize { source: e })?;
            payload.push_str(&line);
            payload.push('\n');
        }

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spool_path)
            .and_then(|mut file| file.write_all(payload.as_bytes()));

        if let Err(e) = result {
            // Put the records back so a later flush can retry them.
            let mut buffer = self.lock();
            let newer = std::mem::replace(&mut *buffer, records);
            buffer.extend(newer);
            return Err(TelemetryError::Spool {
                path: self.spool_path.clone(),
                source: e,
            });
        }

        Ok(records.len())
    }
}
