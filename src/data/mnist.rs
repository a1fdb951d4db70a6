//! MNIST IDX files and a synthetic stand-in

use std::fs;
use std::path::Path;

use log::info;
use ndarray::{Array1, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::LabeledData;
use crate::utils::to_one_hot_encoding;
use crate::{NetError, Result};

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;
const NUM_CLASSES: usize = 10;

/// Train and test splits, images scaled to `[0, 1]` and labels one-hot
#[derive(Clone, Debug)]
pub struct MnistData {
    /// 60k training examples in the standard files
    pub train: LabeledData,
    /// 10k test examples in the standard files
    pub test: LabeledData,
}

fn be_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| NetError::InvalidArgument("truncated IDX header".into()))
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<()> {
    let magic = be_u32(bytes, 0)?;
    if magic != expected {
        return Err(NetError::InvalidArgument(format!(
            "bad IDX magic number {} (expected {})",
            magic, expected
        )));
    }
    Ok(())
}

/// Parse an IDX3 image file into `(n, rows, cols, 1)` bytes
pub fn read_idx_images(bytes: &[u8]) -> Result<Array4<u8>> {
    check_magic(bytes, IMAGES_MAGIC)?;
    let n = be_u32(bytes, 4)? as usize;
    let rows = be_u32(bytes, 8)? as usize;
    let cols = be_u32(bytes, 12)? as usize;
    let end = n
        .checked_mul(rows)
        .and_then(|v| v.checked_mul(cols))
        .and_then(|v| v.checked_add(16))
        .ok_or_else(|| NetError::InvalidArgument("IDX header overflows".into()))?;
    let pixels = bytes
        .get(16..end)
        .ok_or_else(|| NetError::InvalidArgument(format!("IDX image file too short for {} images", n)))?;
    Ok(Array4::from_shape_vec((n, rows, cols, 1), pixels.to_vec())?)
}

/// Parse an IDX1 label file
pub fn read_idx_labels(bytes: &[u8]) -> Result<Array1<u8>> {
    check_magic(bytes, LABELS_MAGIC)?;
    let n = be_u32(bytes, 4)? as usize;
    let labels = bytes
        .get(8..8 + n)
        .ok_or_else(|| NetError::InvalidArgument(format!("IDX label file too short for {} labels", n)))?;
    Ok(Array1::from(labels.to_vec()))
}

fn load_split(dir: &Path, images: &str, labels: &str) -> Result<LabeledData> {
    let images = read_idx_images(&fs::read(dir.join(images))?)?;
    let labels = read_idx_labels(&fs::read(dir.join(labels))?)?;
    let data = images.mapv(|p| f32::from(p) / 255.0).into_dyn();
    LabeledData::new(data, to_one_hot_encoding(&labels, Some(NUM_CLASSES))?)
}

/// Load the four uncompressed MNIST files from `dir`
pub fn load_mnist(dir: impl AsRef<Path>) -> Result<MnistData> {
    let dir = dir.as_ref();
    let train = load_split(dir, "train-images-idx3-ubyte", "train-labels-idx1-ubyte")?;
    let test = load_split(dir, "t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte")?;
    info!(
        "loaded MNIST from {}: {} train, {} test",
        dir.display(),
        train.data.shape()[0],
        test.data.shape()[0]
    );
    Ok(MnistData { train, test })
}

/// Deterministic 28x28 images whose class is the position of a bright block.
///
/// Classes occupy a 2x5 grid of 5x5 blocks on a noisy background, which is
/// enough for the CNN to learn without the real files.
pub fn synthetic_digits(num_examples: usize, seed: u64) -> Result<LabeledData> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut images = Array4::<f32>::zeros((num_examples, 28, 28, 1));
    let mut labels = Vec::with_capacity(num_examples);

    for (i, mut image) in images.outer_iter_mut().enumerate() {
        let class = i % NUM_CLASSES;
        labels.push(class);
        image.mapv_inplace(|_| rng.gen_range(0.0..0.2));
        let top = 4 + (class / 5) * 12;
        let left = 1 + (class % 5) * 5;
        for h in top..top + 5 {
            for w in left..left + 5 {
                image[[h, w, 0]] = rng.gen_range(0.8..1.0);
            }
        }
    }

    let labels = to_one_hot_encoding(&Array1::from(labels), Some(NUM_CLASSES))?;
    LabeledData::new(images.into_dyn(), labels)
}
