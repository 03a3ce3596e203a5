use std::path::{Path, PathBuf};

/// Manages the worker's output directory layout.
///
/// The timestamp log and the telemetry spool both live under a single
/// directory. This struct provides accessors for each well-known path and
/// creates the directory on startup.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    output_file: String,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>, output_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            output_file: output_file.into(),
        }
    }

    /// The root directory (e.g. `data/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the append-only timestamp file.
    pub fn output_file(&self) -> PathBuf {
        self.root.join(&self.output_file)
    }

    /// Default telemetry spool, used when the connection string names none.
    pub fn telemetry_spool(&self) -> PathBuf {
        self.root.join("telemetry.jsonl")
    }

    /// Create the directory if it is missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        if created {
            tracing::info!(path = %self.root.display(), "created output directory");
        }
        Ok(created)
    }
}
