//! Dataset readers, generators and image patch utilities

mod images;
mod mnist;
mod patches;
mod reverse_function;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::core::ExampleSet;
use crate::{NetError, Result};

pub use images::{
    load_image_list, load_image_pairs, resize_to_cover, synthetic_foreground_images, ImageList,
};
pub use mnist::{load_mnist, read_idx_images, read_idx_labels, synthetic_digits, MnistData};
pub use patches::{generate_image_patch_list, stitch_patch_predictions, Patch, PatchConfig, PatchRegion};
pub use reverse_function::{ReverseFunctionConfig, ReverseFunctionDataset};

/// Split into train/test sets after a seeded shuffle.
///
/// `floor(n * test_fraction)` examples go to the test set.
pub fn train_test_split<E: ExampleSet>(examples: &E, test_fraction: f32, seed: u64) -> Result<(E, E)> {
    if !(0.0..1.0).contains(&test_fraction) {
        return Err(NetError::InvalidArgument(format!(
            "test fraction {} must be in [0, 1)",
            test_fraction
        )));
    }
    let n = examples.num_examples();
    let n_test = (n as f32 * test_fraction) as usize;

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test = examples.select(&indices[..n_test])?;
    let train = examples.select(&indices[n_test..])?;
    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LabeledData;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_split_partitions_examples() {
        let data = Array::from_shape_fn(IxDyn(&[10, 1]), |idx| idx[0] as f32);
        let examples = LabeledData::new(data.clone(), data).unwrap();

        let (train, test) = train_test_split(&examples, 0.2, 1).unwrap();
        assert_eq!(train.num_examples(), 8);
        assert_eq!(test.num_examples(), 2);

        let mut all: Vec<f32> = train.data.iter().chain(test.data.iter()).copied().collect();
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(all, (0..10).map(|v| v as f32).collect::<Vec<_>>());

        let (again, _) = train_test_split(&examples, 0.2, 1).unwrap();
        assert_eq!(again.data, train.data);
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        let examples = LabeledData::unlabeled(Array::zeros(IxDyn(&[4, 1]))).unwrap();
        assert!(train_test_split(&examples, 1.0, 0).is_err());
        assert!(train_test_split(&examples, -0.1, 0).is_err());
    }
}
