use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::data::dataset::{vision::MnistItem, InMemDataset};
use flate2::read::GzDecoder;

use crate::model::NUM_CLASSES;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

const WIDTH: usize = 28;
const HEIGHT: usize = 28;

/// Errors raised while reading MNIST IDX files.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Unable to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid magic number in '{path}': expected {expected:#010x}, got {actual:#010x}")]
    InvalidMagic {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid image size in '{path}': expected 28x28, got {rows}x{cols}")]
    InvalidImageSize {
        path: PathBuf,
        rows: usize,
        cols: usize,
    },

    #[error("'{path}' is truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid label {label} at index {index} in '{path}': expected a digit from 0 to 9")]
    InvalidLabel {
        path: PathBuf,
        index: usize,
        label: u8,
    },

    #[error("The {split} split has {images} images but {labels} labels")]
    CountMismatch {
        split: MnistSplit,
        images: usize,
        labels: usize,
    },
}

/// One of the two MNIST splits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MnistSplit {
    Train,
    Test,
}

impl MnistSplit {
    fn images_file(&self) -> &'static str {
        match self {
            Self::Train => "train-images-idx3-ubyte",
            Self::Test => "t10k-images-idx3-ubyte",
        }
    }

    fn labels_file(&self) -> &'static str {
        match self {
            Self::Train => "train-labels-idx1-ubyte",
            Self::Test => "t10k-labels-idx1-ubyte",
        }
    }
}

impl core::fmt::Display for MnistSplit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Test => f.write_str("test"),
        }
    }
}

/// Reads a split from the IDX files stored in `root`.
///
/// Both the raw files and their gzip archives (`.gz`) are accepted, either in
/// `root` itself or in the `MNIST/raw` directory laid out by torchvision. Returns
/// `Ok(None)` when the files of the split aren't present in the directory.
pub fn read_split(
    root: &Path,
    split: MnistSplit,
) -> Result<Option<InMemDataset<MnistItem>>, DatasetError> {
    let (images_path, labels_path) = match (
        locate(root, split.images_file()),
        locate(root, split.labels_file()),
    ) {
        (Some(images), Some(labels)) => (images, labels),
        _ => return Ok(None),
    };

    let images = parse_images(&images_path, &read_bytes(&images_path)?)?;
    let labels = parse_labels(&labels_path, &read_bytes(&labels_path)?)?;

    if images.len() != labels.len() {
        return Err(DatasetError::CountMismatch {
            split,
            images: images.len(),
            labels: labels.len(),
        });
    }

    let items = images
        .into_iter()
        .zip(labels)
        .map(|(image, label)| MnistItem { image, label })
        .collect();

    Ok(Some(InMemDataset::new(items)))
}

fn locate(root: &Path, name: &str) -> Option<PathBuf> {
    // Where torchvision stores the downloaded archives under its root.
    let torchvision = root.join("MNIST").join("raw");

    [root.to_path_buf(), torchvision]
        .into_iter()
        .flat_map(|dir| [dir.join(name), dir.join(format!("{name}.gz"))])
        .find(|path| path.is_file())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let mut bytes = Vec::new();

    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(file).read_to_end(&mut bytes).map_err(io_err)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes).map_err(io_err)?;
    }

    Ok(bytes)
}

fn read_u32(path: &Path, bytes: &[u8], offset: usize) -> Result<u32, DatasetError> {
    let word = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| DatasetError::Truncated {
            path: path.to_path_buf(),
            expected: offset + 4,
            actual: bytes.len(),
        })?;

    Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn check_magic(path: &Path, bytes: &[u8], expected: u32) -> Result<(), DatasetError> {
    let actual = read_u32(path, bytes, 0)?;

    if actual != expected {
        return Err(DatasetError::InvalidMagic {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }

    Ok(())
}

/// Parses an IDX3 image file (16-byte header) into 28x28 images of raw pixel values.
fn parse_images(
    path: &Path,
    bytes: &[u8],
) -> Result<Vec<[[f32; WIDTH]; HEIGHT]>, DatasetError> {
    check_magic(path, bytes, IMAGES_MAGIC)?;

    let count = read_u32(path, bytes, 4)? as usize;
    let rows = read_u32(path, bytes, 8)? as usize;
    let cols = read_u32(path, bytes, 12)? as usize;

    if rows != HEIGHT || cols != WIDTH {
        return Err(DatasetError::InvalidImageSize {
            path: path.to_path_buf(),
            rows,
            cols,
        });
    }

    let expected = 16 + count * WIDTH * HEIGHT;
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            path: path.to_path_buf(),
            expected,
            actual: bytes.len(),
        });
    }

    let images = bytes[16..expected]
        .chunks_exact(WIDTH * HEIGHT)
        .map(|pixels| {
            let mut image = [[0f32; WIDTH]; HEIGHT];
            for (i, pixel) in pixels.iter().enumerate() {
                image[i / WIDTH][i % WIDTH] = *pixel as f32;
            }
            image
        })
        .collect();

    Ok(images)
}

/// Parses an IDX1 label file (8-byte header).
fn parse_labels(path: &Path, bytes: &[u8]) -> Result<Vec<u8>, DatasetError> {
    check_magic(path, bytes, LABELS_MAGIC)?;

    let count = read_u32(path, bytes, 4)? as usize;
    let expected = 8 + count;

    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            path: path.to_path_buf(),
            expected,
            actual: bytes.len(),
        });
    }

    let labels = &bytes[8..expected];

    if let Some((index, &label)) = labels
        .iter()
        .enumerate()
        .find(|(_, label)| **label as usize >= NUM_CLASSES)
    {
        return Err(DatasetError::InvalidLabel {
            path: path.to_path_buf(),
            index,
            label,
        });
    }

    Ok(labels.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::Dataset;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn idx_images(images: &[[u8; WIDTH * HEIGHT]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(images.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&(HEIGHT as u32).to_be_bytes());
        bytes.extend_from_slice(&(WIDTH as u32).to_be_bytes());
        for image in images {
            bytes.extend_from_slice(image);
        }
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn parses_images_row_major() {
        let mut image = [0u8; WIDTH * HEIGHT];
        image[WIDTH + 2] = 255;
        let bytes = idx_images(&[image, [7u8; WIDTH * HEIGHT]]);

        let images = parse_images(Path::new("images"), &bytes).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[0][1][2], 255.0);
        assert_eq!(images[0][2][1], 0.0);
        assert_eq!(images[1][27][27], 7.0);
    }

    #[test]
    fn rejects_wrong_magic_number() {
        let bytes = idx_labels(&[1, 2, 3]);

        let err = parse_images(Path::new("labels"), &bytes).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::InvalidMagic {
                expected: IMAGES_MAGIC,
                actual: LABELS_MAGIC,
                ..
            }
        ));
    }

    #[test]
    fn rejects_truncated_label_file() {
        let mut bytes = idx_labels(&[1, 2, 3, 4]);
        bytes.truncate(10);

        let err = parse_labels(Path::new("labels"), &bytes).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::Truncated {
                expected: 12,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn rejects_labels_outside_the_classes() {
        let bytes = idx_labels(&[0, 9, 10, 3]);

        let err = parse_labels(Path::new("labels"), &bytes).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::InvalidLabel {
                index: 2,
                label: 10,
                ..
            }
        ));
    }

    #[test]
    fn reads_torchvision_layout() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("MNIST").join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(
            raw.join("t10k-images-idx3-ubyte"),
            idx_images(&[[1u8; WIDTH * HEIGHT]]),
        )
        .unwrap();
        std::fs::write(raw.join("t10k-labels-idx1-ubyte.gz"), gzip(&idx_labels(&[6]))).unwrap();

        let dataset = read_split(dir.path(), MnistSplit::Test)
            .unwrap()
            .expect("test split is present");

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.get(0).unwrap().label, 6);
    }

    #[test]
    fn reads_raw_and_gzipped_splits() {
        let dir = tempfile::tempdir().unwrap();
        let images = [[3u8; WIDTH * HEIGHT], [9u8; WIDTH * HEIGHT]];
        std::fs::write(
            dir.path().join("train-images-idx3-ubyte"),
            idx_images(&images),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("train-labels-idx1-ubyte.gz"),
            gzip(&idx_labels(&[4, 8])),
        )
        .unwrap();

        let dataset = read_split(dir.path(), MnistSplit::Train)
            .unwrap()
            .expect("train split is present");

        assert_eq!(dataset.len(), 2);
        let item = dataset.get(1).unwrap();
        assert_eq!(item.label, 8);
        assert_eq!(item.image[0][0], 9.0);
    }

    #[test]
    fn missing_split_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let dataset = read_split(dir.path(), MnistSplit::Test).unwrap();

        assert!(dataset.is_none());
    }

    #[test]
    fn rejects_split_with_mismatched_counts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("t10k-images-idx3-ubyte"),
            idx_images(&[[0u8; WIDTH * HEIGHT]]),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("t10k-labels-idx1-ubyte"),
            idx_labels(&[1, 2]),
        )
        .unwrap();

        let err = read_split(dir.path(), MnistSplit::Test).err().expect("expected an error");

        assert!(matches!(
            err,
            DatasetError::CountMismatch {
                split: MnistSplit::Test,
                images: 1,
                labels: 2
            }
        ));
    }
}
