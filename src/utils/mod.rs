//! Utility functions for runners: encodings, schedules, IO and timing

mod history;
mod occlusion;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::{Array, ArrayD, Dimension, IxDyn};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::{NetError, Result};

pub use history::{display_train_history, save_train_history};
pub use occlusion::{visualize_by_partial_occlusion, OcclusionGrid};

/// One-hot encode integer class labels.
///
/// The class axis is appended, except that a trailing axis of length 1 is
/// replaced by it: `(n,)` and `(n, 1)` both become `(n, classes)`, while
/// `(n, h, w)` becomes `(n, h, w, classes)`. Without `num_classes` the count
/// is `max(label) + 1`; an explicit count must exceed every label.
pub fn to_one_hot_encoding<T, D>(labels: &Array<T, D>, num_classes: Option<usize>) -> Result<ArrayD<f32>>
where
    T: ToPrimitive + Copy,
    D: Dimension,
{
    let indices = labels
        .iter()
        .map(|v| {
            v.to_usize()
                .ok_or_else(|| NetError::InvalidArgument("labels must be non-negative integers".into()))
        })
        .collect::<Result<Vec<usize>>>()?;
    let max = indices.iter().copied().max();

    let num_classes = match (num_classes, max) {
        (None, Some(max)) => max + 1,
        (None, None) => {
            return Err(NetError::InvalidArgument(
                "cannot infer the class count of an empty label array".into(),
            ))
        }
        (Some(n), Some(max)) if n <= max => {
            return Err(NetError::InvalidArgument(format!(
                "num_classes ({}) has to be greater than the largest label ({})",
                n, max
            )))
        }
        (Some(n), _) => n,
    };

    let mut shape = labels.shape().to_vec();
    if shape.len() > 1 && shape.last() == Some(&1) {
        shape.pop();
    }
    shape.push(num_classes);

    let mut encoded = ArrayD::<f32>::zeros(IxDyn(&shape));
    if let Some(flat) = encoded.as_slice_mut() {
        for (row, &class) in indices.iter().enumerate() {
            flat[row * num_classes + class] = 1.0;
        }
    }
    Ok(encoded)
}

/// Time-based decay: `lr0 / (1 + decay_rate * epoch)`
pub fn time_based_learning_rate(epoch: usize, initial_learning_rate: f32, decay_rate: f32) -> f32 {
    initial_learning_rate / (1.0 + decay_rate * epoch as f32)
}

/// Step decay: `lr0 * drop_rate ^ floor((1 + epoch) / epoch_drop)`
pub fn drop_based_learning_rate(epoch: usize, initial_learning_rate: f32, drop_rate: f32, epoch_drop: f32) -> f32 {
    initial_learning_rate * drop_rate.powf(((1.0 + epoch as f32) / epoch_drop).floor())
}

/// Intersection over union of two pixel boxes `[x_min, y_min, x_max, y_max]`.
///
/// Bounds are inclusive, so a box covers `x_max - x_min + 1` columns.
pub fn compute_intersection_over_union_of_aabb(aabb1: [f32; 4], aabb2: [f32; 4]) -> f32 {
    let x_a = aabb1[0].max(aabb2[0]);
    let y_a = aabb1[1].max(aabb2[1]);
    let x_b = aabb1[2].min(aabb2[2]);
    let y_b = aabb1[3].min(aabb2[3]);

    let inter = (x_b - x_a + 1.0).max(0.0) * (y_b - y_a + 1.0).max(0.0);
    let area1 = (aabb1[2] - aabb1[0] + 1.0) * (aabb1[3] - aabb1[1] + 1.0);
    let area2 = (aabb2[2] - aabb2[0] + 1.0) * (aabb2[3] - aabb2[1] + 1.0);
    inter / (area1 + area2 - inter)
}

/// Create `path` and its parents if missing
pub fn make_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Save object to JSON file
pub fn save_json<T: Serialize>(obj: &T, path: impl AsRef<Path>) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, obj)?;
    Ok(())
}

/// Load object from JSON file
pub fn load_json<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Timestamp used to tell runs apart, e.g. `20180116T212902`
pub fn run_timestamp() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Output directories of one run.
///
/// Models and inferences go under the result root, train/validation
/// summaries under the log root; every name ends with the run suffix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunDirs {
    /// Checkpoints
    pub model: PathBuf,
    /// Predictions and figures
    pub inference: PathBuf,
    /// Training summaries
    pub train_summary: PathBuf,
    /// Validation summaries
    pub val_summary: PathBuf,
}

impl RunDirs {
    /// Directories named `<prefix>_<kind>_<suffix>`; `suffix` defaults to a fresh timestamp
    pub fn new(result_root: impl AsRef<Path>, log_root: impl AsRef<Path>, prefix: &str, suffix: Option<&str>) -> Self {
        let suffix = suffix.map_or_else(run_timestamp, str::to_string);
        let result_root = result_root.as_ref();
        let log_root = log_root.as_ref();
        RunDirs {
            model: result_root.join(format!("{}_model_{}", prefix, suffix)),
            inference: result_root.join(format!("{}_inference_{}", prefix, suffix)),
            train_summary: log_root.join(format!("{}_train_{}", prefix, suffix)),
            val_summary: log_root.join(format!("{}_val_{}", prefix, suffix)),
        }
    }

    /// Create every directory
    pub fn create(&self) -> Result<()> {
        for dir in [&self.model, &self.inference, &self.train_summary, &self.val_summary] {
            make_dir(dir)?;
        }
        Ok(())
    }
}

/// Timing utilities
pub mod timing {
    use std::time::Instant;

    /// Logs its elapsed time at debug level when dropped
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start new timer
        pub fn new(name: &str) -> Self {
            Timer {
                start: Instant::now(),
                name: name.to_string(),
            }
        }

        /// Seconds since start
        pub fn elapsed(&self) -> f32 {
            self.start.elapsed().as_secs_f32()
        }

        /// Log elapsed time at info level
        pub fn report(&self) {
            log::info!("{}: {:.3}s", self.name, self.elapsed());
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            log::debug!("{} finished after {:.3}s", self.name, self.elapsed());
        }
    }
}
