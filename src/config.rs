use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::log::{FileSagaLog, InMemorySagaLog, SagaLog};

/// Tuning for saga controllers.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Depth of each saga's update queue. Callers beyond this many pending
    /// updates wait for a slot before their update is admitted.
    pub update_queue_capacity: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            update_queue_capacity: 100,
        }
    }
}

impl SagaConfig {
    pub fn with_update_queue_capacity(mut self, capacity: usize) -> Self {
        // tokio's mpsc panics on a zero-sized buffer
        self.update_queue_capacity = capacity.max(1);
        self
    }
}

/// Which storage backend holds the saga log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SagaLogConfig {
    /// Process-local log; history is lost on exit.
    #[default]
    Memory,
    /// Append-only JSON-lines files, one per saga, under `dir`.
    File { dir: PathBuf },
}

impl SagaLogConfig {
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        SagaLogConfig::File { dir: dir.into() }
    }

    /// Builds the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if a file-backed log's directory cannot be created.
    pub async fn create(&self) -> Result<Arc<dyn SagaLog>> {
        match self {
            SagaLogConfig::Memory => Ok(Arc::new(InMemorySagaLog::new())),
            SagaLogConfig::File { dir } => Ok(Arc::new(FileSagaLog::open(dir.clone()).await?)),
        }
    }
}
