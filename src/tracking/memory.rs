use std::collections::BTreeSet;

use super::{MetricSink, Metrics, ModelArtifact, Params, RunHandle, RunStatus, TrackingError};

/// A call received by the [in-memory sink](InMemorySink).
#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    BeginRun {
        run_id: String,
        experiment_name: String,
    },
    Params(Params),
    Metrics {
        step: usize,
        values: Metrics,
    },
    Metric {
        name: String,
        value: f64,
    },
    Artifact {
        name: String,
        size: usize,
    },
    EndRun {
        run_id: String,
        status: RunStatus,
    },
}

/// In memory sink, useful when testing and debugging.
#[derive(Default, Debug)]
pub struct InMemorySink {
    events: Vec<SinkEvent>,
    open_runs: BTreeSet<String>,
    num_runs: usize,
    fail_metrics_at: Option<usize>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every metric snapshot logged at `step`.
    pub fn failing_metrics_at(mut self, step: usize) -> Self {
        self.fail_metrics_at = Some(step);
        self
    }

    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    /// The metric snapshots with their step, in logging order.
    pub fn snapshots(&self) -> Vec<(usize, &Metrics)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Metrics { step, values } => Some((*step, values)),
                _ => None,
            })
            .collect()
    }

    /// The individually logged metrics, in logging order.
    pub fn scalars(&self) -> Vec<(&str, f64)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Metric { name, value } => Some((name.as_str(), *value)),
                _ => None,
            })
            .collect()
    }

    pub fn params(&self) -> Params {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Params(params) => Some(params.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The statuses the runs were closed with.
    pub fn closed(&self) -> Vec<RunStatus> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::EndRun { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn check_open(&self, run: &RunHandle) -> Result<(), TrackingError> {
        if self.open_runs.contains(run.run_id()) {
            Ok(())
        } else {
            Err(TrackingError::UnknownRun(run.run_id().to_string()))
        }
    }
}

impl MetricSink for InMemorySink {
    fn begin_run(&mut self, experiment_name: &str) -> Result<RunHandle, TrackingError> {
        self.num_runs += 1;
        let run_id = format!("run-{}", self.num_runs);

        self.open_runs.insert(run_id.clone());
        self.events.push(SinkEvent::BeginRun {
            run_id: run_id.clone(),
            experiment_name: experiment_name.to_string(),
        });

        Ok(RunHandle::new(run_id, "0"))
    }

    fn log_params(&mut self, run: &RunHandle, params: &Params) -> Result<(), TrackingError> {
        self.check_open(run)?;
        self.events.push(SinkEvent::Params(params.clone()));
        Ok(())
    }

    fn log_metrics(
        &mut self,
        run: &RunHandle,
        metrics: &Metrics,
        step: usize,
    ) -> Result<(), TrackingError> {
        self.check_open(run)?;

        if self.fail_metrics_at == Some(step) {
            return Err(TrackingError::Api {
                endpoint: "metrics".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        self.events.push(SinkEvent::Metrics {
            step,
            values: metrics.clone(),
        });
        Ok(())
    }

    fn log_metric(
        &mut self,
        run: &RunHandle,
        name: &str,
        value: f64,
    ) -> Result<(), TrackingError> {
        self.check_open(run)?;
        self.events.push(SinkEvent::Metric {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn log_model_artifact(
        &mut self,
        run: &RunHandle,
        artifact: &ModelArtifact,
    ) -> Result<(), TrackingError> {
        self.check_open(run)?;
        self.events.push(SinkEvent::Artifact {
            name: artifact.name.clone(),
            size: artifact.record.len(),
        });
        Ok(())
    }

    fn end_run(&mut self, run: RunHandle, status: RunStatus) -> Result<(), TrackingError> {
        self.check_open(&run)?;
        self.open_runs.remove(run.run_id());
        self.events.push(SinkEvent::EndRun {
            run_id: run.run_id().to_string(),
            status,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order() {
        let mut sink = InMemorySink::new();
        let run = sink.begin_run("mnist").unwrap();

        sink.log_metrics(&run, &Metrics::from([("loss".to_string(), 0.5)]), 1)
            .unwrap();
        sink.log_metric(&run, "final", 0.9).unwrap();
        sink.end_run(run, RunStatus::Finished).unwrap();

        assert_eq!(sink.snapshots().len(), 1);
        assert_eq!(sink.scalars(), vec![("final", 0.9)]);
        assert_eq!(sink.closed(), vec![RunStatus::Finished]);
    }

    #[test]
    fn rejects_calls_on_closed_runs() {
        let mut sink = InMemorySink::new();
        let run = sink.begin_run("mnist").unwrap();
        let stale = RunHandle::new(run.run_id(), "0");
        sink.end_run(run, RunStatus::Failed).unwrap();

        let err = sink.log_metric(&stale, "final", 0.9).unwrap_err();

        assert!(matches!(err, TrackingError::UnknownRun(id) if id == "run-1"));
    }
}
