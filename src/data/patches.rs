//! Tiling large images into fixed-size patches and stitching predictions back

use ndarray::{s, Array2, Array3, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::{NetError, Result};

/// Patch generation parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Patch height
    pub patch_height: usize,
    /// Patch width
    pub patch_width: usize,
    /// Keep only patches whose label has at least this share of non-zero pixels
    pub foreground_ratio: Option<f32>,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            patch_height: 224,
            patch_width: 224,
            foreground_ratio: Some(0.02),
        }
    }
}

impl PatchConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.patch_height == 0 || self.patch_width == 0 {
            return Err("Patch size must be positive".to_string());
        }
        if let Some(ratio) = self.foreground_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err("Foreground ratio must be in [0, 1]".to_string());
            }
        }
        Ok(())
    }
}

/// Half-open pixel box `[top, bottom) x [left, right)` of a patch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRegion {
    /// First row
    pub top: usize,
    /// First column
    pub left: usize,
    /// Row past the end
    pub bottom: usize,
    /// Column past the end
    pub right: usize,
}

/// Non-overlapping starts, plus one flush with the far edge if it is not covered.
fn patch_starts(extent: usize, patch: usize) -> Vec<usize> {
    if extent < patch {
        return Vec::new();
    }
    let mut starts: Vec<usize> = (0..=extent - patch).step_by(patch).collect();
    if starts.last().map_or(false, |&s| s + patch < extent) {
        starts.push(extent - patch);
    }
    starts
}

/// A cut-out patch with its optional label and position
#[derive(Clone, Debug)]
pub struct Patch {
    /// Image pixels
    pub image: Array3<u8>,
    /// Label pixels, when a label map was given
    pub label: Option<Array3<u8>>,
    /// Where the patch came from
    pub region: PatchRegion,
}

/// Tile `image` (and its `label` map) into patches.
///
/// Images smaller than the patch size give no patches. With a label and a
/// foreground ratio, patches with too little foreground are dropped.
pub fn generate_image_patch_list(
    image: ArrayView3<u8>,
    label: Option<ArrayView3<u8>>,
    config: &PatchConfig,
) -> Result<Vec<Patch>> {
    config.validate().map_err(NetError::InvalidArgument)?;
    let (height, width, _) = image.dim();
    if let Some(label) = &label {
        if label.shape()[..2] != image.shape()[..2] {
            return Err(NetError::ShapeMismatch(format!(
                "label {:?} does not match image {:?}",
                label.shape(),
                image.shape()
            )));
        }
    }

    let mut patches = Vec::new();
    for &top in &patch_starts(height, config.patch_height) {
        for &left in &patch_starts(width, config.patch_width) {
            let region = PatchRegion {
                top,
                left,
                bottom: top + config.patch_height,
                right: left + config.patch_width,
            };
            let window = s![region.top..region.bottom, region.left..region.right, ..];
            let patch_label = label.as_ref().map(|l| l.slice(window).to_owned());

            if let (Some(ratio), Some(patch_label)) = (config.foreground_ratio, &patch_label) {
                let nonzero = patch_label.iter().filter(|&&v| v != 0).count();
                if (nonzero as f32) / (patch_label.len() as f32) < ratio {
                    continue;
                }
            }
            patches.push(Patch {
                image: image.slice(window).to_owned(),
                label: patch_label,
                region,
            });
        }
    }
    Ok(patches)
}

/// Place per-patch scores `(n, ph, pw, classes)` back onto a `height x width`
/// canvas, averaging where patches overlap.
pub fn stitch_patch_predictions(
    patches: ArrayView4<f32>,
    regions: &[PatchRegion],
    height: usize,
    width: usize,
) -> Result<Array3<f32>> {
    let (n, _, _, classes) = patches.dim();
    if n != regions.len() {
        return Err(NetError::ShapeMismatch(format!(
            "{} patches but {} regions",
            n,
            regions.len()
        )));
    }

    let mut canvas = Array3::<f32>::zeros((height, width, classes));
    let mut counts = Array2::<f32>::zeros((height, width));
    for (patch, region) in patches.axis_iter(Axis(0)).zip(regions) {
        if region.bottom < region.top || region.right < region.left {
            return Err(NetError::ShapeMismatch(format!("region {:?} is inverted", region)));
        }
        if region.bottom > height || region.right > width {
            return Err(NetError::InvalidArgument(format!(
                "region {:?} lies outside a {}x{} canvas",
                region, height, width
            )));
        }
        if patch.dim() != (region.bottom - region.top, region.right - region.left, classes) {
            return Err(NetError::ShapeMismatch(format!(
                "patch {:?} does not fill region {:?}",
                patch.shape(),
                region
            )));
        }
        let mut target = canvas.slice_mut(s![region.top..region.bottom, region.left..region.right, ..]);
        target += &patch;
        counts
            .slice_mut(s![region.top..region.bottom, region.left..region.right])
            .mapv_inplace(|c| c + 1.0);
    }

    for ((h, w), &count) in counts.indexed_iter() {
        if count > 1.0 {
            canvas.slice_mut(s![h, w, ..]).mapv_inplace(|v| v / count);
        }
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn config(size: usize, ratio: Option<f32>) -> PatchConfig {
        PatchConfig {
            patch_height: size,
            patch_width: size,
            foreground_ratio: ratio,
        }
    }

    #[test]
    fn test_patch_starts_align_last_to_edge() {
        assert_eq!(patch_starts(10, 4), vec![0, 4, 6]);
        assert_eq!(patch_starts(8, 4), vec![0, 4]);
        assert_eq!(patch_starts(3, 4), Vec::<usize>::new());
    }

    #[test]
    fn test_patches_cover_image() {
        let image = Array3::<u8>::from_shape_fn((10, 8, 1), |(h, w, _)| (h * 8 + w) as u8);
        let patches = generate_image_patch_list(image.view(), None, &config(4, Some(0.5))).unwrap();
        // The ratio only applies with labels.
        assert_eq!(patches.len(), 6);
        let last = &patches[5];
        assert_eq!(last.region, PatchRegion { top: 6, left: 4, bottom: 10, right: 8 });
        assert_eq!(last.image[[0, 0, 0]], image[[6, 4, 0]]);
    }

    #[test]
    fn test_foreground_filter() {
        let image = Array3::<u8>::zeros((4, 8, 3));
        let mut label = Array3::<u8>::zeros((4, 8, 1));
        label.slice_mut(s![.., 4.., ..]).fill(255);

        let patches = generate_image_patch_list(image.view(), Some(label.view()), &config(4, Some(0.02))).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].region.left, 4);
        assert!(patches[0].label.is_some());
    }

    #[test]
    fn test_small_image_has_no_patches() {
        let image = Array3::<u8>::zeros((3, 3, 1));
        assert!(generate_image_patch_list(image.view(), None, &config(4, None)).unwrap().is_empty());
    }

    #[test]
    fn test_stitch_averages_overlap() {
        let regions = [
            PatchRegion { top: 0, left: 0, bottom: 2, right: 2 },
            PatchRegion { top: 0, left: 1, bottom: 2, right: 3 },
        ];
        let mut patches = Array4::<f32>::zeros((2, 2, 2, 1));
        patches.slice_mut(s![0, .., .., ..]).fill(1.0);
        patches.slice_mut(s![1, .., .., ..]).fill(3.0);

        let canvas = stitch_patch_predictions(patches.view(), &regions, 2, 3).unwrap();
        assert_eq!(canvas[[0, 0, 0]], 1.0);
        assert_eq!(canvas[[0, 1, 0]], 2.0);
        assert_eq!(canvas[[1, 2, 0]], 3.0);

        assert!(stitch_patch_predictions(patches.view(), &regions[..1], 2, 3).is_err());
        assert!(stitch_patch_predictions(patches.view(), &regions, 2, 2).is_err());
    }

    #[test]
    fn test_stitch_rejects_inverted_region() {
        let regions = [PatchRegion { top: 2, left: 0, bottom: 0, right: 2 }];
        let patches = Array4::<f32>::zeros((1, 2, 2, 1));
        assert!(matches!(
            stitch_patch_predictions(patches.view(), &regions, 4, 4),
            Err(NetError::ShapeMismatch(_))
        ));
    }
}
