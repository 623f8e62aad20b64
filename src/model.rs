use crate::{data::MnistBatch, error::TrainingError};
use burn::{
    nn::{loss::CrossEntropyLossConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    prelude::*,
    tensor::Distribution,
    train::ClassificationOutput,
};
use core::fmt;

/// Number of values in a flattened 28x28 image.
pub const INPUT_SIZE: usize = 28 * 28;
/// Number of digit classes.
pub const NUM_CLASSES: usize = 10;

const HIDDEN_SIZE_1: usize = 128;
const HIDDEN_SIZE_2: usize = 64;

/// Whether a forward pass is part of training or evaluation.
///
/// Dropout is only applied in [training](PassMode::Train) mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassMode {
    Train,
    Eval,
}

impl fmt::Display for PassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("training"),
            Self::Eval => f.write_str("evaluation"),
        }
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 0.2)]
    pub dropout: f64,
}

/// Multi-layer perceptron classifying flattened MNIST images.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    pub(crate) input: Linear<B>,
    pub(crate) hidden: Linear<B>,
    pub(crate) output: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl ModelConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            input: LinearConfig::new(INPUT_SIZE, HIDDEN_SIZE_1).init(device),
            hidden: LinearConfig::new(HIDDEN_SIZE_1, HIDDEN_SIZE_2).init(device),
            output: LinearConfig::new(HIDDEN_SIZE_2, NUM_CLASSES).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> Model<B> {
    /// Computes the class scores (logits) of a batch of flattened images.
    ///
    /// # Shapes
    ///   - Images [batch_size, 784]
    ///   - Output [batch_size, num_classes]
    pub fn predict(
        &self,
        images: Tensor<B, 2>,
        mode: PassMode,
    ) -> Result<Tensor<B, 2>, TrainingError> {
        let [_batch_size, features] = images.dims();

        if features != INPUT_SIZE {
            return Err(TrainingError::Shape {
                expected: INPUT_SIZE,
                actual: features,
            });
        }

        let x = self.input.forward(images);
        let x = self.activation.forward(x);
        let x = self.regularize(x, mode);

        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);
        let x = self.regularize(x, mode);

        Ok(self.output.forward(x))
    }

    pub fn predict_train(&self, images: Tensor<B, 2>) -> Result<Tensor<B, 2>, TrainingError> {
        self.predict(images, PassMode::Train)
    }

    pub fn predict_eval(&self, images: Tensor<B, 2>) -> Result<Tensor<B, 2>, TrainingError> {
        self.predict(images, PassMode::Eval)
    }

    /// Computes the logits and the mean cross-entropy loss of a batch.
    pub fn forward_classification(
        &self,
        batch: MnistBatch<B>,
        mode: PassMode,
    ) -> Result<ClassificationOutput<B>, TrainingError> {
        let [num_images, _] = batch.images.dims();
        let [num_targets] = batch.targets.dims();

        if num_images != num_targets {
            return Err(TrainingError::Shape {
                expected: num_images,
                actual: num_targets,
            });
        }

        let targets = batch.targets;
        let output = self.predict(batch.images, mode)?;
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        Ok(ClassificationOutput {
            loss,
            output,
            targets,
        })
    }

    /// Inverted dropout, driven by the mode alone so it behaves the same on every backend.
    fn regularize(&self, x: Tensor<B, 2>, mode: PassMode) -> Tensor<B, 2> {
        let prob = self.dropout.prob;

        if mode == PassMode::Eval || prob == 0.0 {
            return x;
        }

        let dropped = x.random_like(Distribution::Bernoulli(prob)).equal_elem(1);
        x.mask_fill(dropped, 0.0) / (1.0 - prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    #[test]
    fn predict_outputs_one_score_per_class() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 2>::ones([3, INPUT_SIZE], &device);

        let scores = model.predict_eval(images).unwrap();

        assert_eq!(scores.dims(), [3, NUM_CLASSES]);
    }

    #[test]
    fn predict_rejects_unflattened_inputs() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 2>::ones([2, 28], &device);

        let err = model.predict(images, PassMode::Train).unwrap_err();

        assert!(matches!(
            err,
            TrainingError::Shape {
                expected: INPUT_SIZE,
                actual: 28
            }
        ));
    }

    #[test]
    fn dropout_only_applies_in_training_mode() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_dropout(0.5)
            .init::<TestAutodiffBackend>(&device);
        let images = Tensor::<TestAutodiffBackend, 2>::ones([8, INPUT_SIZE], &device);

        let eval_1 = model.predict_eval(images.clone()).unwrap().into_data();
        let eval_2 = model.predict_eval(images.clone()).unwrap().into_data();
        let train = model.predict_train(images).unwrap().into_data();

        assert_eq!(eval_1, eval_2);
        assert_ne!(eval_1, train);
    }

    #[test]
    fn training_mode_drops_activations_without_autodiff() {
        let device = Default::default();
        TestBackend::seed(3);
        let model = ModelConfig::new()
            .with_dropout(0.5)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 2>::ones([8, INPUT_SIZE], &device);

        let eval = model.predict_eval(images.clone()).unwrap().into_data();
        let train = model.predict(images.clone(), PassMode::Train).unwrap().into_data();
        let no_dropout = ModelConfig::new()
            .with_dropout(0.0)
            .init::<TestBackend>(&device);

        assert_ne!(eval, train);
        assert_ne!(eval, model.predict_train(images.clone()).unwrap().into_data());
        assert_eq!(
            no_dropout.predict_train(images.clone()).unwrap().into_data(),
            no_dropout.predict_eval(images).unwrap().into_data()
        );
    }

    #[test]
    fn classification_rejects_mismatched_targets() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let batch = MnistBatch {
            images: Tensor::<TestBackend, 2>::zeros([4, INPUT_SIZE], &device),
            targets: Tensor::<TestBackend, 1, Int>::zeros([3], &device),
        };

        let err = model
            .forward_classification(batch, PassMode::Eval)
            .err().expect("expected an error");

        assert!(matches!(
            err,
            TrainingError::Shape {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn classification_loss_is_a_non_negative_scalar() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let batch = MnistBatch {
            images: Tensor::<TestBackend, 2>::ones([5, INPUT_SIZE], &device),
            targets: Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 2, 3, 4], &device),
        };

        let output = model
            .forward_classification(batch, PassMode::Eval)
            .unwrap();
        let loss = output.loss.into_scalar().elem::<f64>();

        assert!(loss >= 0.0);
        assert_eq!(output.output.dims(), [5, NUM_CLASSES]);
    }
}
