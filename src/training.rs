use burn::{
    optim::{AdamConfig, Optimizer},
    prelude::*,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::{
    data::{MnistProvider, EVAL_BATCH_SIZE},
    epoch::{run_pass, EpochResult, Optimization},
    error::TrainingError,
    model::{Model, ModelConfig, PassMode},
    tracking::{MetricSink, Metrics, ModelArtifact, Params, RunHandle, RunStatus, TrackingError},
};

/// Name of the model artifact attached to every finished run.
pub const MODEL_ARTIFACT: &str = "model";
/// Name of the metric holding the test accuracy of the last epoch.
pub const FINAL_TEST_ACCURACY: &str = "final_test_accuracy";

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = 3)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = "EVAL_BATCH_SIZE")]
    pub eval_batch_size: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = "String::from(\"/data/mnist\")")]
    pub data_location: String,
    #[config(default = "String::from(\"mnist-training\")")]
    pub experiment_name: String,
    #[config(default = 42)]
    pub seed: u64,
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
}

impl TrainingConfig {
    fn validate(&self) -> Result<(), TrainingError> {
        let invalid = |field: &str| {
            Err(TrainingError::Configuration(format!(
                "{field} must be greater than zero"
            )))
        };

        if self.num_epochs == 0 {
            return invalid("num_epochs");
        }
        if self.batch_size == 0 {
            return invalid("batch_size");
        }
        if self.eval_batch_size == 0 {
            return invalid("eval_batch_size");
        }
        if self.learning_rate <= 0.0 {
            return invalid("learning_rate");
        }

        Ok(())
    }

    /// Parameters logged when the tracked run opens.
    pub fn params(&self, device: &impl core::fmt::Debug) -> Params {
        [
            ("epochs", self.num_epochs.to_string()),
            ("batch_size", self.batch_size.to_string()),
            ("learning_rate", self.learning_rate.to_string()),
            ("optimizer", "Adam".to_string()),
            ("device", format!("{device:?}")),
            ("eval_batch_size", self.eval_batch_size.to_string()),
            ("seed", self.seed.to_string()),
            ("dropout", self.model.dropout.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}

/// Results of one epoch on both splits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: EpochResult,
    pub test: EpochResult,
}

impl EpochMetrics {
    /// The snapshot sent to the sink for this epoch.
    pub fn to_metrics(&self) -> Metrics {
        Metrics::from([
            ("train_loss".to_string(), self.train.mean_loss),
            ("train_accuracy".to_string(), self.train.accuracy),
            ("test_loss".to_string(), self.test.mean_loss),
            ("test_accuracy".to_string(), self.test.accuracy),
        ])
    }
}

/// What a finished run returns to its caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub run_id: String,
    pub history: Vec<EpochMetrics>,
    pub final_test_accuracy: f64,
}

/// Phases of a run. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Init,
    Running { epoch: usize },
    Finalizing,
    Closed,
}

/// Progress of a run.
#[derive(Debug)]
pub struct RunState {
    phase: RunPhase,
    history: Vec<EpochMetrics>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Test accuracy of the latest completed epoch.
    pub fn last_test_accuracy(&self) -> Option<f64> {
        self.history.last().map(|metrics| metrics.test.accuracy)
    }

    /// Enters [RunPhase::Finalizing] unless the run already reached it.
    fn finalize(&mut self) {
        if self.phase < RunPhase::Finalizing {
            self.advance(RunPhase::Finalizing);
        }
    }

    fn advance(&mut self, phase: RunPhase) {
        debug_assert!(
            phase > self.phase,
            "invalid transition {:?} -> {phase:?}",
            self.phase
        );
        log::debug!("Run phase {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }
}

/// Owns the handle of the tracked run until it is closed.
///
/// Dropping an unclosed run (early return or unwinding) closes it as failed.
struct ActiveRun<'a, S: MetricSink + ?Sized> {
    sink: &'a mut S,
    handle: Option<RunHandle>,
}

impl<'a, S: MetricSink + ?Sized> ActiveRun<'a, S> {
    fn begin(sink: &'a mut S, experiment_name: &str) -> Result<Self, TrackingError> {
        let handle = sink.begin_run(experiment_name)?;

        Ok(Self {
            sink,
            handle: Some(handle),
        })
    }

    fn run_id(&self) -> &str {
        self.handle.as_ref().map(RunHandle::run_id).unwrap_or_default()
    }

    fn with_handle<T>(
        &mut self,
        call: impl FnOnce(&mut S, &RunHandle) -> Result<T, TrackingError>,
    ) -> Result<T, TrackingError> {
        match &self.handle {
            Some(handle) => call(&mut *self.sink, handle),
            None => Err(TrackingError::UnknownRun(String::new())),
        }
    }

    fn close(mut self, status: RunStatus) -> Result<(), TrackingError> {
        match self.handle.take() {
            Some(handle) => self.sink.end_run(handle, status),
            None => Ok(()),
        }
    }
}

impl<S: MetricSink + ?Sized> Drop for ActiveRun<'_, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::error!("Run {} dropped while open, closing it", handle.run_id());

            if let Err(err) = self.sink.end_run(handle, RunStatus::Failed) {
                log::error!("Unable to close the run: {err}");
            }
        }
    }
}

/// Trains the model for `config.num_epochs` epochs and tracks the run in `sink`.
///
/// The run is closed exactly once: as finished when every epoch and the model
/// artifact were logged, as failed otherwise. Errors are returned as raised,
/// after the run is closed.
pub fn run<B, S>(
    config: &TrainingConfig,
    provider: &MnistProvider,
    device: B::Device,
    sink: &mut S,
) -> Result<TrainingSummary, TrainingError>
where
    B: AutodiffBackend,
    S: MetricSink + ?Sized,
{
    config.validate()?;

    B::seed(config.seed);

    let model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init::<B, Model<B>>();
    let mut state = RunState::new();

    let mut run = ActiveRun::begin(sink, &config.experiment_name)?;
    log::info!(
        "Training run {} on {device:?} for {} epochs",
        run.run_id(),
        config.num_epochs
    );

    let outcome = execute(config, provider, &device, model, &mut optim, &mut run, &mut state);

    match outcome {
        Ok(final_test_accuracy) => {
            let run_id = run.run_id().to_string();
            run.close(RunStatus::Finished)?;
            state.advance(RunPhase::Closed);
            log::info!("Run {run_id} finished - final test accuracy {final_test_accuracy:.4}");

            Ok(TrainingSummary {
                run_id,
                history: state.history,
                final_test_accuracy,
            })
        }
        Err(err) => {
            log::error!("Run {} failed: {err}", run.run_id());
            state.finalize();

            if let Err(close_err) = run.close(RunStatus::Failed) {
                log::error!("Unable to close the failed run: {close_err}");
            }
            state.advance(RunPhase::Closed);

            Err(err)
        }
    }
}

fn execute<B, O, S>(
    config: &TrainingConfig,
    provider: &MnistProvider,
    device: &B::Device,
    mut model: Model<B>,
    optim: &mut O,
    run: &mut ActiveRun<'_, S>,
    state: &mut RunState,
) -> Result<f64, TrainingError>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
    S: MetricSink + ?Sized,
{
    let params = config.params(device);
    run.with_handle(|sink, handle| sink.log_params(handle, &params))?;

    let train_loader = provider.train_loader::<B>(config.batch_size, config.seed, device);
    let test_loader = provider.test_loader::<B>(config.eval_batch_size, device);

    for epoch in 1..=config.num_epochs {
        state.advance(RunPhase::Running { epoch });

        let (trained, train) = run_pass(
            model,
            train_loader.iter(),
            PassMode::Train,
            Some(Optimization::new(&mut *optim, config.learning_rate)),
        )?;
        check_split_size(PassMode::Train, provider.train_len(), &train)?;

        let (evaluated, test) =
            run_pass::<B, O, _>(trained, test_loader.iter(), PassMode::Eval, None)?;
        check_split_size(PassMode::Eval, provider.test_len(), &test)?;
        model = evaluated;

        let metrics = EpochMetrics { epoch, train, test };
        log::info!(
            "Epoch {epoch}/{} - train loss {:.4}, train accuracy {:.4}, test loss {:.4}, test accuracy {:.4}",
            config.num_epochs,
            train.mean_loss,
            train.accuracy,
            test.mean_loss,
            test.accuracy
        );

        run.with_handle(|sink, handle| sink.log_metrics(handle, &metrics.to_metrics(), epoch))?;
        state.history.push(metrics);
    }

    state.finalize();

    let final_test_accuracy = state.last_test_accuracy().ok_or_else(|| {
        TrainingError::Configuration("the run completed no epoch".to_string())
    })?;

    let artifact = model_artifact(config, model)?;
    run.with_handle(|sink, handle| sink.log_model_artifact(handle, &artifact))?;
    run.with_handle(|sink, handle| {
        sink.log_metric(handle, FINAL_TEST_ACCURACY, final_test_accuracy)
    })?;

    Ok(final_test_accuracy)
}

fn check_split_size(
    mode: PassMode,
    expected: usize,
    result: &EpochResult,
) -> Result<(), TrainingError> {
    if result.num_samples != expected {
        return Err(TrainingError::SplitSize {
            mode,
            expected,
            actual: result.num_samples,
        });
    }

    Ok(())
}

/// Serializes the model record along with its configuration.
pub fn model_artifact<B: Backend>(
    config: &TrainingConfig,
    model: Model<B>,
) -> Result<ModelArtifact, TrainingError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .record(model.into_record(), ())
        .map_err(|err| TrainingError::Artifact(err.to_string()))?;

    Ok(ModelArtifact {
        name: MODEL_ARTIFACT.to_string(),
        config: config.model.to_string(),
        record,
    })
}
