//! Occlusion sensitivity maps

use ndarray::{s, Array3, ArrayView2, ArrayView4, Axis, Ix2};

use crate::core::{LabeledData, NeuralNet, NeuralNetPredictor};
use crate::{NetError, Result};

/// Grid layout of an occlusion sweep
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OcclusionGrid {
    /// Number of cells along height and width
    pub grid_counts: (usize, usize),
    /// Occluder height and width, centered on each cell
    pub occlusion_size: (usize, usize),
    /// Value written into the occluded pixels
    pub occlusion_color: f32,
}

/// Cell `[start, end)` ranges along one axis plus the occluder range centered on it.
fn cell_spans(extent: usize, count: usize, occlusion: usize) -> Vec<((usize, usize), (usize, usize))> {
    let cell = (extent + count - 1) / count;
    (0..count)
        .filter(|&i| cell * i < extent)
        .map(|i| {
            let start = cell * i;
            let end = cell * (i + 1);
            let center = 0.5 * (start + end) as f32;
            let half = 0.5 * occlusion as f32;
            let occ_start = (center - half).floor().max(0.0) as usize;
            let occ_end = ((center + half).ceil() as usize).min(extent);
            ((start, end.min(extent)), (occ_start, occ_end))
        })
        .collect()
}

/// Probability of the true class while each grid cell is occluded.
///
/// For every cell the occluder is painted over all `images` (NHWC), the net
/// predicts, and the score `max(prediction * label)` of each example is
/// written over that cell of an `(n, height, width)` map. Low values mark
/// regions the prediction depends on.
pub fn visualize_by_partial_occlusion<N>(
    net: &mut N,
    images: ArrayView4<f32>,
    labels: ArrayView2<f32>,
    grid: &OcclusionGrid,
    batch_size: Option<usize>,
) -> Result<Array3<f32>>
where
    N: NeuralNet<Examples = LabeledData>,
{
    let (n, height, width, _) = images.dim();
    if n == 0 {
        return Err(NetError::EmptyDataset);
    }
    if labels.nrows() != n {
        return Err(NetError::ShapeMismatch(format!(
            "{} images but {} labels",
            n,
            labels.nrows()
        )));
    }
    if grid.grid_counts.0 == 0 || grid.grid_counts.1 == 0 {
        return Err(NetError::InvalidArgument("grid counts must be positive".into()));
    }

    let rows = cell_spans(height, grid.grid_counts.0, grid.occlusion_size.0);
    let cols = cell_spans(width, grid.grid_counts.1, grid.occlusion_size.1);
    let predictor = NeuralNetPredictor::new();
    let mut map = Array3::<f32>::zeros((n, height, width));

    for &((h_start, h_end), (oh_start, oh_end)) in &rows {
        for &((w_start, w_end), (ow_start, ow_end)) in &cols {
            let mut occluded = images.to_owned();
            occluded
                .slice_mut(s![.., oh_start..oh_end, ow_start..ow_end, ..])
                .fill(grid.occlusion_color);

            let examples = LabeledData::unlabeled(occluded.into_dyn())?;
            let predictions = predictor
                .predict(net, &examples, batch_size)?
                .into_dimensionality::<Ix2>()?;
            if predictions.dim() != labels.dim() {
                return Err(NetError::ShapeMismatch(format!(
                    "predictions {:?} do not match labels {:?}",
                    predictions.shape(),
                    labels.shape()
                )));
            }

            let scores = (&predictions * &labels)
                .map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |a, &b| a.max(b)));
            for (i, score) in scores.iter().enumerate() {
                map.slice_mut(s![i, h_start..h_end, w_start..w_end]).fill(*score);
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CnnConfig, CnnModel};
    use ndarray::{Array2, Array4};

    #[test]
    fn test_cell_spans_clip_to_image() {
        let spans = cell_spans(10, 3, 2);
        // Cells of ceil(10 / 3) = 4 pixels; the last one is cut at the edge.
        assert_eq!(spans[0], ((0, 4), (1, 3)));
        assert_eq!(spans[2], ((8, 10), (9, 10)));
    }

    #[test]
    fn test_occlusion_map_is_constant_per_cell() {
        let config = CnnConfig {
            image_height: 8,
            image_width: 8,
            channels: 1,
            num_classes: 2,
            conv1_filters: 2,
            conv2_filters: 2,
            kernel_size: 3,
            hidden_units: 4,
            dropout: 0.0,
            seed: 3,
        };
        let mut net = CnnModel::new(config).unwrap();
        net.create_inference_model().unwrap();

        let images = Array4::from_elem((2, 8, 8, 1), 0.5);
        let labels = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let grid = OcclusionGrid {
            grid_counts: (2, 2),
            occlusion_size: (2, 2),
            occlusion_color: 0.0,
        };

        let map = visualize_by_partial_occlusion(&mut net, images.view(), labels.view(), &grid, Some(1)).unwrap();
        assert_eq!(map.dim(), (2, 8, 8));
        assert!(map.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert_eq!(map[[0, 0, 0]], map[[0, 3, 3]]);
        assert_eq!(map[[1, 4, 4]], map[[1, 7, 7]]);
    }

    #[test]
    fn test_rejects_mismatched_labels() {
        let mut net = CnnModel::new(CnnConfig {
            image_height: 4,
            image_width: 4,
            hidden_units: 2,
            conv1_filters: 1,
            conv2_filters: 1,
            kernel_size: 3,
            num_classes: 2,
            ..CnnConfig::default()
        })
        .unwrap();
        net.create_inference_model().unwrap();
        let images = Array4::zeros((2, 4, 4, 1));
        let labels = Array2::zeros((3, 2));
        let grid = OcclusionGrid {
            grid_counts: (1, 1),
            occlusion_size: (1, 1),
            occlusion_color: 0.0,
        };
        assert!(visualize_by_partial_occlusion(&mut net, images.view(), labels.view(), &grid, None).is_err());
    }
}
