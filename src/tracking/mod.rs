mod file;
mod memory;
mod mlflow;

pub use file::*;
pub use memory::*;
pub use mlflow::*;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

/// Run parameters, logged once when the run starts.
pub type Params = BTreeMap<String, String>;
/// A snapshot of named metric values.
pub type Metrics = BTreeMap<String, f64>;

/// Handle to an open tracked run.
///
/// The handle can't be cloned: it is moved into [MetricSink::end_run], so a run
/// is closed by its single owner exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct RunHandle {
    run_id: String,
    experiment_id: String,
}

impl RunHandle {
    pub fn new(run_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            experiment_id: experiment_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }
}

/// Terminal status of a tracked run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

/// A serialized model, stored as a directory named after the artifact.
#[derive(Clone, Debug)]
pub struct ModelArtifact {
    pub name: String,
    /// The model configuration, as JSON.
    pub config: String,
    /// The model record, as produced by a bytes recorder.
    pub record: Vec<u8>,
}

impl ModelArtifact {
    /// Files of the artifact directory with their content.
    pub fn files(&self) -> [(&'static str, &[u8]); 2] {
        [
            ("config.json", self.config.as_bytes()),
            ("model.bin", self.record.as_slice()),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Request to the tracking server failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("The tracking server answered {status} to '{endpoint}': {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Unable to write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to encode tracking data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run '{0}' is not open")]
    UnknownRun(String),
}

/// Destination of the parameters, metrics and model of tracked runs.
///
/// Every call is fire-and-forget from the caller's point of view: errors are
/// propagated, never retried.
pub trait MetricSink {
    /// Opens a new run in the given experiment, creating the experiment if needed.
    fn begin_run(&mut self, experiment_name: &str) -> Result<RunHandle, TrackingError>;

    fn log_params(&mut self, run: &RunHandle, params: &Params) -> Result<(), TrackingError>;

    /// Logs a snapshot of metrics sharing the same step.
    fn log_metrics(
        &mut self,
        run: &RunHandle,
        metrics: &Metrics,
        step: usize,
    ) -> Result<(), TrackingError>;

    fn log_metric(&mut self, run: &RunHandle, name: &str, value: f64)
        -> Result<(), TrackingError>;

    fn log_model_artifact(
        &mut self,
        run: &RunHandle,
        artifact: &ModelArtifact,
    ) -> Result<(), TrackingError>;

    /// Closes the run.
    fn end_run(&mut self, run: RunHandle, status: RunStatus) -> Result<(), TrackingError>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
