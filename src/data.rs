use std::{path::Path, sync::Arc};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::{
            vision::{MnistDataset, MnistItem},
            Dataset,
        },
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::{
    dataset::{read_split, DatasetError, MnistSplit},
    model::INPUT_SIZE,
};

/// Default batch size of the evaluation split.
pub const EVAL_BATCH_SIZE: usize = 1000;

// Normalization statistics of the MNIST training images.
const MEAN: f32 = 0.1307;
const STD: f32 = 0.3081;

#[derive(Clone, Debug)]
pub struct MnistBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    pub images: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> MnistBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<MnistItem, MnistBatch<B>> for MnistBatcher<B> {
    fn batch(&self, items: Vec<MnistItem>) -> MnistBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 2>::from_data(data, &self.device))
            .map(|tensor| tensor.reshape([1, INPUT_SIZE]))
            // Normalize: scale between [0,1] and make the mean=0 and std=1.
            .map(|tensor| ((tensor / 255) - MEAN) / STD)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    &self.device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        MnistBatch { images, targets }
    }
}

impl<B: Backend> MnistBatch<B> {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        let [batch_size] = self.targets.dims();
        batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: AutodiffBackend> MnistBatch<B> {
    /// Detaches the batch from the autodiff graph.
    pub fn inner(self) -> MnistBatch<B::InnerBackend> {
        MnistBatch {
            images: self.images.inner(),
            targets: self.targets.inner(),
        }
    }
}

/// Supplies the training and evaluation splits.
///
/// The training loader is reshuffled every time it is iterated, the
/// evaluation loader always yields batches in the same order.
#[derive(Clone)]
pub struct MnistProvider {
    train: Arc<dyn Dataset<MnistItem>>,
    test: Arc<dyn Dataset<MnistItem>>,
}

impl MnistProvider {
    pub fn new<D1, D2>(train: D1, test: D2) -> Self
    where
        D1: Dataset<MnistItem> + 'static,
        D2: Dataset<MnistItem> + 'static,
    {
        Self {
            train: Arc::new(train),
            test: Arc::new(test),
        }
    }

    /// Loads both splits from the IDX files stored in `location`.
    ///
    /// A split whose files are missing is downloaded to the burn dataset cache instead.
    pub fn from_location(location: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let location = location.as_ref();

        let train: Arc<dyn Dataset<MnistItem>> = match read_split(location, MnistSplit::Train)? {
            Some(dataset) => Arc::new(dataset),
            None => {
                log::warn!(
                    "No MNIST train files in '{}', using the download cache",
                    location.display()
                );
                Arc::new(MnistDataset::train())
            }
        };
        let test: Arc<dyn Dataset<MnistItem>> = match read_split(location, MnistSplit::Test)? {
            Some(dataset) => Arc::new(dataset),
            None => {
                log::warn!(
                    "No MNIST test files in '{}', using the download cache",
                    location.display()
                );
                Arc::new(MnistDataset::test())
            }
        };

        log::info!(
            "Loaded MNIST with {} train and {} test images",
            train.len(),
            test.len()
        );

        Ok(Self { train, test })
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn test_len(&self) -> usize {
        self.test.len()
    }

    /// Training split, shuffled from `seed` on each iteration.
    pub fn train_loader<B: Backend>(
        &self,
        batch_size: usize,
        seed: u64,
        device: &B::Device,
    ) -> Arc<dyn DataLoader<MnistBatch<B>>> {
        DataLoaderBuilder::new(MnistBatcher::<B>::new(device.clone()))
            .batch_size(batch_size)
            .shuffle(seed)
            .build(self.train.clone())
    }

    /// Evaluation split, in dataset order.
    pub fn test_loader<B: Backend>(
        &self,
        batch_size: usize,
        device: &B::Device,
    ) -> Arc<dyn DataLoader<MnistBatch<B>>> {
        DataLoaderBuilder::new(MnistBatcher::<B>::new(device.clone()))
            .batch_size(batch_size)
            .build(self.test.clone())
    }
}
