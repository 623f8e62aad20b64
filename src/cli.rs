use std::path::PathBuf;

use burn::{optim::AdamConfig, prelude::*, tensor::backend::AutodiffBackend};
use clap::{Parser, ValueEnum};

use crate::{
    data::MnistProvider,
    error::TrainingError,
    model::ModelConfig,
    tracking::{FileSink, MetricSink, MlflowSink, TrackingError, DEFAULT_TRACKING_URI},
    training::{self, TrainingConfig, TrainingSummary},
};

#[derive(Parser, Debug)]
#[command(version, about = "Train an MNIST classifier and track the run")]
pub struct Cli {
    /// Number of epochs.
    #[arg(long, default_value_t = 3)]
    pub epochs: usize,

    /// Training batch size.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Adam learning rate.
    #[arg(long, default_value_t = 0.001)]
    pub lr: f64,

    /// Directory holding the MNIST IDX files.
    #[arg(long, default_value = "/data/mnist")]
    pub data_dir: PathBuf,

    #[arg(long, default_value = "mnist-training")]
    pub experiment_name: String,

    /// MLflow tracking server.
    #[arg(long, env = "MLFLOW_TRACKING_URI", default_value = DEFAULT_TRACKING_URI)]
    pub tracking_uri: String,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Where the run is tracked.
    #[arg(long, value_enum, default_value_t = SinkKind::Mlflow)]
    pub sink: SinkKind,

    /// Root directory of the file sink.
    #[arg(long, default_value = "mlruns")]
    pub output_dir: PathBuf,

    /// Saved training config; replaces the hyperparameter flags.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write the logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// MLflow REST API.
    Mlflow,
    /// Local directory.
    File,
}

impl Cli {
    pub fn training_config(&self) -> Result<TrainingConfig, TrainingError> {
        if let Some(path) = &self.config {
            return TrainingConfig::load(path).map_err(|err| {
                TrainingError::Configuration(format!(
                    "unable to load '{}': {err}",
                    path.display()
                ))
            });
        }

        Ok(TrainingConfig::new(ModelConfig::new(), AdamConfig::new())
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.lr)
            .with_data_location(self.data_dir.display().to_string())
            .with_experiment_name(self.experiment_name.clone())
            .with_seed(self.seed))
    }

    pub fn metric_sink(&self) -> Result<Box<dyn MetricSink>, TrackingError> {
        Ok(match self.sink {
            SinkKind::Mlflow => {
                log::info!("Tracking runs on {}", self.tracking_uri);
                Box::new(MlflowSink::new(&self.tracking_uri)?)
            }
            SinkKind::File => {
                log::info!("Tracking runs in {}", self.output_dir.display());
                Box::new(FileSink::new(&self.output_dir))
            }
        })
    }
}

/// Loads the data and runs the training on `device`.
pub fn launch<B: AutodiffBackend>(
    cli: &Cli,
    device: B::Device,
) -> Result<TrainingSummary, TrainingError> {
    let config = cli.training_config()?;
    let provider = MnistProvider::from_location(&config.data_location)?;
    let mut sink = cli.metric_sink()?;

    training::run::<B, _>(&config, &provider, device, sink.as_mut())
}
