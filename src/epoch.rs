use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
    LearningRate,
};
use serde::{Deserialize, Serialize};

use crate::{
    data::MnistBatch,
    error::TrainingError,
    model::{Model, PassMode},
};

/// Aggregated loss and accuracy of one full pass over a split.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochResult {
    /// Mean of the per-sample cross-entropy loss.
    pub mean_loss: f64,
    /// Fraction of correctly classified samples, in `[0, 1]`.
    pub accuracy: f64,
    /// Number of samples seen during the pass.
    pub num_samples: usize,
}

/// Running sums of a pass.
///
/// Batch losses are weighted by their batch size and the accuracy is the exact
/// ratio of integer counts, so a final partial batch doesn't bias the result.
#[derive(Debug, Default)]
pub struct EpochAccumulator {
    loss_sum: f64,
    num_correct: usize,
    num_samples: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a batch given its mean loss.
    pub fn update(&mut self, batch_loss: f64, num_correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.num_correct += num_correct;
        self.num_samples += batch_size;
    }

    pub fn finish(self, mode: PassMode) -> Result<EpochResult, TrainingError> {
        if self.num_samples == 0 {
            return Err(TrainingError::EmptyDataset { mode });
        }

        Ok(EpochResult {
            mean_loss: self.loss_sum / self.num_samples as f64,
            accuracy: self.num_correct as f64 / self.num_samples as f64,
            num_samples: self.num_samples,
        })
    }
}

/// The optimizer driving a training pass and its learning rate.
pub struct Optimization<'a, O> {
    pub optim: &'a mut O,
    pub lr: LearningRate,
}

impl<'a, O> Optimization<'a, O> {
    pub fn new(optim: &'a mut O, lr: LearningRate) -> Self {
        Self { optim, lr }
    }
}

/// Runs one pass over `batches` in the given mode.
///
/// A training pass requires an optimizer and returns the updated model; an
/// evaluation pass must not receive one and returns the model untouched.
pub fn run_pass<B, O, I>(
    model: Model<B>,
    batches: I,
    mode: PassMode,
    optimization: Option<Optimization<'_, O>>,
) -> Result<(Model<B>, EpochResult), TrainingError>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
    I: Iterator<Item = MnistBatch<B>>,
{
    match (mode, optimization) {
        (PassMode::Train, Some(Optimization { optim, lr })) => {
            train_pass(model, batches, optim, lr)
        }
        (PassMode::Eval, None) => {
            let result = eval_pass(&model.valid(), batches.map(MnistBatch::inner))?;
            Ok((model, result))
        }
        (PassMode::Train, None) => Err(TrainingError::Configuration(
            "a training pass requires an optimizer".to_string(),
        )),
        (PassMode::Eval, Some(_)) => Err(TrainingError::Configuration(
            "an evaluation pass can't update the model".to_string(),
        )),
    }
}

/// Runs a training pass, applying exactly one optimizer step per batch.
pub fn train_pass<B, O, I>(
    mut model: Model<B>,
    batches: I,
    optim: &mut O,
    lr: LearningRate,
) -> Result<(Model<B>, EpochResult), TrainingError>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
    I: Iterator<Item = MnistBatch<B>>,
{
    log::info!("Executing training pass");

    let mut accumulator = EpochAccumulator::new();

    for (iteration, batch) in batches.enumerate() {
        let batch_size = batch.len();
        let item = model.forward_classification(batch, PassMode::Train)?;

        let batch_loss = item.loss.clone().into_scalar().elem::<f64>();
        let num_correct = num_correct(item.output.inner(), item.targets.inner());

        // Gradients of this batch only; the step consumes them.
        let grads = item.loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(lr, model, grads);

        accumulator.update(batch_loss, num_correct, batch_size);
        log::debug!("Iteration {} - loss {batch_loss:.4}", iteration + 1);
    }

    let result = accumulator.finish(PassMode::Train)?;
    log::info!(
        "Training pass done on {} samples - loss {:.4}, accuracy {:.4}",
        result.num_samples,
        result.mean_loss,
        result.accuracy
    );

    Ok((model, result))
}

/// Runs an evaluation pass; dropout is disabled and no parameter is touched.
pub fn eval_pass<B, I>(model: &Model<B>, batches: I) -> Result<EpochResult, TrainingError>
where
    B: Backend,
    I: Iterator<Item = MnistBatch<B>>,
{
    log::info!("Executing evaluation pass");

    let mut accumulator = EpochAccumulator::new();

    for batch in batches {
        let batch_size = batch.len();
        let item = model.forward_classification(batch, PassMode::Eval)?;

        let batch_loss = item.loss.into_scalar().elem::<f64>();
        let num_correct = num_correct(item.output, item.targets);

        accumulator.update(batch_loss, num_correct, batch_size);
    }

    let result = accumulator.finish(PassMode::Eval)?;
    log::info!(
        "Evaluation pass done on {} samples - loss {:.4}, accuracy {:.4}",
        result.num_samples,
        result.mean_loss,
        result.accuracy
    );

    Ok(result)
}

/// Number of samples whose highest score is the target class.
fn num_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _num_classes] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);

    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}
