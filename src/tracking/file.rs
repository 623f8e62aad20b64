use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{
    timestamp_millis, MetricSink, Metrics, ModelArtifact, Params, RunHandle, RunStatus,
    TrackingError,
};

const PARAMS_FILE: &str = "params.json";
const METRICS_FILE: &str = "metrics.jsonl";
const STATUS_FILE: &str = "status.json";
const ARTIFACTS_DIR: &str = "artifacts";

/// One line of the metrics file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricLine {
    pub name: String,
    pub value: f64,
    pub step: usize,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunStatusFile {
    status: String,
    start_time: i64,
    end_time: Option<i64>,
}

/// Sink storing every run in a local directory.
///
/// ```txt
/// <root>/<experiment>/<run_id>/
///   params.json
///   metrics.jsonl
///   status.json
///   artifacts/<artifact>/{config.json, model.bin}
/// ```
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory of a run.
    pub fn run_directory(&self, run: &RunHandle) -> PathBuf {
        self.root.join(run.experiment_id()).join(run.run_id())
    }

    /// Read the metrics logged for a run.
    pub fn read_metrics(&self, run: &RunHandle) -> Result<Vec<MetricLine>, TrackingError> {
        let path = self.run_directory(run).join(METRICS_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(TrackingError::Io { path, source }),
        };

        content
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(TrackingError::from))
            .collect()
    }

    fn open_directory(&self, run: &RunHandle) -> Result<PathBuf, TrackingError> {
        let directory = self.run_directory(run);

        if directory.join(STATUS_FILE).is_file() {
            Ok(directory)
        } else {
            Err(TrackingError::UnknownRun(run.run_id().to_string()))
        }
    }

    fn append_metrics(
        &self,
        run: &RunHandle,
        lines: impl Iterator<Item = MetricLine>,
    ) -> Result<(), TrackingError> {
        let path = self.open_directory(run)?.join(METRICS_FILE);
        let io_err = |source| TrackingError::Io {
            path: path.clone(),
            source,
        };

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;

        for line in lines {
            let mut encoded = serde_json::to_string(&line)?;
            encoded.push('\n');
            file.write_all(encoded.as_bytes()).map_err(io_err)?;
        }

        Ok(())
    }
}

fn experiment_directory_name(name: &str) -> String {
    name.replace(['/', '\\', ' '], "_")
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), TrackingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| TrackingError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(path, content).map_err(|source| TrackingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_status(path: &Path) -> Result<RunStatusFile, TrackingError> {
    let content = fs::read_to_string(path).map_err(|source| TrackingError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_json::from_str(&content)?)
}

impl MetricSink for FileSink {
    fn begin_run(&mut self, experiment_name: &str) -> Result<RunHandle, TrackingError> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run = RunHandle::new(run_id, experiment_directory_name(experiment_name));

        let status = RunStatusFile {
            status: "RUNNING".to_string(),
            start_time: timestamp_millis(),
            end_time: None,
        };
        write_file(
            &self.run_directory(&run).join(STATUS_FILE),
            &serde_json::to_vec_pretty(&status)?,
        )?;

        log::info!(
            "Tracking run {} in {}",
            run.run_id(),
            self.run_directory(&run).display()
        );

        Ok(run)
    }

    fn log_params(&mut self, run: &RunHandle, params: &Params) -> Result<(), TrackingError> {
        let path = self.open_directory(run)?.join(PARAMS_FILE);

        let mut merged: BTreeMap<String, String> = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(_) => BTreeMap::new(),
        };
        merged.extend(params.clone());

        write_file(&path, &serde_json::to_vec_pretty(&merged)?)
    }

    fn log_metrics(
        &mut self,
        run: &RunHandle,
        metrics: &Metrics,
        step: usize,
    ) -> Result<(), TrackingError> {
        let timestamp = timestamp_millis();

        self.append_metrics(
            run,
            metrics.iter().map(|(name, value)| MetricLine {
                name: name.clone(),
                value: *value,
                step,
                timestamp,
            }),
        )
    }

    fn log_metric(
        &mut self,
        run: &RunHandle,
        name: &str,
        value: f64,
    ) -> Result<(), TrackingError> {
        let line = MetricLine {
            name: name.to_string(),
            value,
            step: 0,
            timestamp: timestamp_millis(),
        };

        self.append_metrics(run, std::iter::once(line))
    }

    fn log_model_artifact(
        &mut self,
        run: &RunHandle,
        artifact: &ModelArtifact,
    ) -> Result<(), TrackingError> {
        let directory = self
            .open_directory(run)?
            .join(ARTIFACTS_DIR)
            .join(&artifact.name);

        for (file_name, content) in artifact.files() {
            write_file(&directory.join(file_name), content)?;
        }

        Ok(())
    }

    fn end_run(&mut self, run: RunHandle, status: RunStatus) -> Result<(), TrackingError> {
        let path = self.open_directory(&run)?.join(STATUS_FILE);

        let mut content = read_status(&path)?;
        content.status = status.as_str().to_string();
        content.end_time = Some(timestamp_millis());

        write_file(&path, &serde_json::to_vec_pretty(&content)?)
    }
}
