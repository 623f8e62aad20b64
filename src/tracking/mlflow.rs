use std::time::Duration;

use reqwest::{
    blocking::{Client, Response},
    header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    timestamp_millis, MetricSink, Metrics, ModelArtifact, Params, RunHandle, RunStatus,
    TrackingError,
};

/// Default address of the tracking server inside the cluster.
pub const DEFAULT_TRACKING_URI: &str = "http://mlflow.mlflow.svc.cluster.local:5000";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct Param {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct Metric {
    key: String,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[derive(Debug, Serialize)]
struct CreateExperiment<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRun<'a> {
    experiment_id: &'a str,
    start_time: i64,
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
pub(crate) struct LogBatch<'a> {
    run_id: &'a str,
    metrics: Vec<Metric>,
    params: Vec<Param>,
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UpdateRun<'a> {
    run_id: &'a str,
    status: &'static str,
    end_time: i64,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentInfo,
}

#[derive(Debug, Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunResponse,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
}

/// Sink talking to an MLflow tracking server through its REST API.
///
/// Artifacts are uploaded through the server's artifact proxy
/// (`mlflow server --serve-artifacts`, the default since MLflow 2.0).
pub struct MlflowSink {
    client: Client,
    base_url: String,
}

impl MlflowSink {
    pub fn new(tracking_uri: &str) -> Result<Self, TrackingError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("mnist-training/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: tracking_uri.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{path}", self.base_url)
    }

    pub(crate) fn artifact_url(&self, run: &RunHandle, path: &str) -> String {
        format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}/artifacts/{path}",
            self.base_url,
            run.experiment_id(),
            run.run_id()
        )
    }

    fn post<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, TrackingError> {
        let url = self.endpoint(path);
        let response = self.client.post(&url).json(body).send()?;

        Ok(check(url, response)?.json()?)
    }

    fn experiment_id(&self, name: &str) -> Result<String, TrackingError> {
        let url = self.endpoint("experiments/get-by-name");
        let response = self
            .client
            .get(&url)
            .query(&[("experiment_name", name)])
            .send()?;

        if response.status() == StatusCode::NOT_FOUND {
            log::info!("Creating experiment '{name}'");
            let created: CreateExperimentResponse =
                self.post("experiments/create", &CreateExperiment { name })?;
            return Ok(created.experiment_id);
        }

        let found: GetExperimentResponse = check(url, response)?.json()?;
        Ok(found.experiment.experiment_id)
    }

    fn log_batch(&self, run: &RunHandle, batch: LogBatch<'_>) -> Result<(), TrackingError> {
        debug_assert_eq!(batch.run_id, run.run_id());
        // The endpoint answers with an empty object.
        let _: serde_json::Value = self.post("runs/log-batch", &batch)?;
        Ok(())
    }
}

fn check(endpoint: String, response: Response) -> Result<Response, TrackingError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    Err(TrackingError::Api {
        endpoint,
        status: status.as_u16(),
        body: response.text().unwrap_or_default(),
    })
}

pub(crate) fn create_run_request(experiment_id: &str, start_time: i64) -> CreateRun<'_> {
    CreateRun {
        experiment_id,
        start_time,
        tags: vec![
            Tag {
                key: "mlflow.source.type".to_string(),
                value: "LOCAL".to_string(),
            },
            Tag {
                key: "mlflow.source.name".to_string(),
                value: env!("CARGO_PKG_NAME").to_string(),
            },
        ],
    }
}

pub(crate) fn params_batch<'a>(run_id: &'a str, params: &Params) -> LogBatch<'a> {
    LogBatch {
        run_id,
        metrics: Vec::new(),
        params: params
            .iter()
            .map(|(key, value)| Param {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        tags: Vec::new(),
    }
}

pub(crate) fn metrics_batch<'a>(
    run_id: &'a str,
    metrics: &Metrics,
    step: usize,
    timestamp: i64,
) -> LogBatch<'a> {
    LogBatch {
        run_id,
        metrics: metrics
            .iter()
            .map(|(key, value)| Metric {
                key: key.clone(),
                value: *value,
                timestamp,
                step: step as i64,
            })
            .collect(),
        params: Vec::new(),
        tags: Vec::new(),
    }
}

impl MetricSink for MlflowSink {
    fn begin_run(&mut self, experiment_name: &str) -> Result<RunHandle, TrackingError> {
        let experiment_id = self.experiment_id(experiment_name)?;
        let created: CreateRunResponse = self.post(
            "runs/create",
            &create_run_request(&experiment_id, timestamp_millis()),
        )?;

        log::info!(
            "Started MLflow run {} in experiment '{experiment_name}' ({experiment_id})",
            created.run.info.run_id
        );

        Ok(RunHandle::new(created.run.info.run_id, experiment_id))
    }

    fn log_params(&mut self, run: &RunHandle, params: &Params) -> Result<(), TrackingError> {
        self.log_batch(run, params_batch(run.run_id(), params))
    }

    fn log_metrics(
        &mut self,
        run: &RunHandle,
        metrics: &Metrics,
        step: usize,
    ) -> Result<(), TrackingError> {
        self.log_batch(
            run,
            metrics_batch(run.run_id(), metrics, step, timestamp_millis()),
        )
    }

    fn log_metric(
        &mut self,
        run: &RunHandle,
        name: &str,
        value: f64,
    ) -> Result<(), TrackingError> {
        let metrics = Metrics::from([(name.to_string(), value)]);
        self.log_batch(
            run,
            metrics_batch(run.run_id(), &metrics, 0, timestamp_millis()),
        )
    }

    fn log_model_artifact(
        &mut self,
        run: &RunHandle,
        artifact: &ModelArtifact,
    ) -> Result<(), TrackingError> {
        for (file_name, content) in artifact.files() {
            let url = self.artifact_url(run, &format!("{}/{file_name}", artifact.name));
            let response = self.client.put(&url).body(content.to_vec()).send()?;
            check(url, response)?;
        }

        log::info!("Uploaded artifact '{}'", artifact.name);
        Ok(())
    }

    fn end_run(&mut self, run: RunHandle, status: RunStatus) -> Result<(), TrackingError> {
        let _: serde_json::Value = self.post(
            "runs/update",
            &UpdateRun {
                run_id: run.run_id(),
                status: status.as_str(),
                end_time: timestamp_millis(),
            },
        )?;

        log::info!("MLflow run {} ended as {}", run.run_id(), status.as_str());
        Ok(())
    }
}
