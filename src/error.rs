use crate::{dataset::DatasetError, model::PassMode, tracking::TrackingError};

/// Errors raised while training or evaluating the model.
///
/// None of them are recovered inside a pass: a single bad batch aborts it, and
/// the orchestrator only closes the tracked run before returning the error.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    /// The input tensor (or its labels) doesn't have the expected shape.
    #[error("Invalid tensor shape: expected {expected} on the last dimension, got {actual}")]
    Shape { expected: usize, actual: usize },

    /// The pass mode and the optimizer don't match.
    #[error("Invalid pass configuration: {0}")]
    Configuration(String),

    /// The batch sequence didn't yield a single batch.
    #[error("The {mode} pass received no batches")]
    EmptyDataset { mode: PassMode },

    /// The number of samples seen during a pass differs from the split size.
    #[error("The {mode} pass saw {actual} samples, but the split declares {expected}")]
    SplitSize {
        mode: PassMode,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    /// The model record couldn't be serialized.
    #[error("Unable to serialize the model: {0}")]
    Artifact(String),
}
