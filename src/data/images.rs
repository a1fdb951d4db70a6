//! Image list loading and resizing

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb};
use log::{debug, warn};
use ndarray::{Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::{NetError, Result};

/// Decoded images in file name order, as `(height, width, channels)` bytes
#[derive(Clone, Debug, Default)]
pub struct ImageList {
    /// File stems with the suffix removed, used to pair images with labels
    pub names: Vec<String>,
    /// Pixel data
    pub images: Vec<Array3<u8>>,
}

impl ImageList {
    /// Number of images
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

fn decode(path: &Path, grayscale: bool) -> Result<Array3<u8>> {
    let img = image::open(path)?;
    if grayscale {
        let buf = img.to_luma8();
        let (w, h) = buf.dimensions();
        Ok(Array3::from_shape_vec((h as usize, w as usize, 1), buf.into_raw())?)
    } else {
        let buf = img.to_rgb8();
        let (w, h) = buf.dimensions();
        Ok(Array3::from_shape_vec((h as usize, w as usize, 3), buf.into_raw())?)
    }
}

/// Load every `<name><suffix>.<extension>` file in `dir`, decoding in parallel.
///
/// Labels are usually loaded with `grayscale` set so they come back with a
/// single channel.
pub fn load_image_list(dir: impl AsRef<Path>, suffix: &str, extension: &str, grayscale: bool) -> Result<ImageList> {
    let ending = format!("{}.{}", suffix, extension);
    let mut entries: Vec<(String, PathBuf)> = fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?.to_string();
            let stem = file_name.strip_suffix(&ending)?.to_string();
            Some((stem, path))
        })
        .collect();
    entries.sort();

    let images = entries
        .par_iter()
        .map(|(_, path)| decode(path, grayscale))
        .collect::<Result<Vec<_>>>()?;
    debug!("loaded {} images from {}", images.len(), dir.as_ref().display());

    Ok(ImageList {
        names: entries.into_iter().map(|(stem, _)| stem).collect(),
        images,
    })
}

/// Images paired with same-named single-channel label maps.
///
/// Images without a label, or whose label has a different size, are skipped.
pub fn load_image_pairs(
    image_dir: impl AsRef<Path>,
    image_suffix: &str,
    label_dir: impl AsRef<Path>,
    label_suffix: &str,
    extension: &str,
) -> Result<Vec<(Array3<u8>, Array3<u8>)>> {
    let images = load_image_list(image_dir, image_suffix, extension, false)?;
    let labels = load_image_list(label_dir, label_suffix, extension, true)?;

    let mut pairs = Vec::with_capacity(images.len());
    for (name, image) in images.names.iter().zip(images.images) {
        let Some(idx) = labels.names.iter().position(|n| n == name) else {
            warn!("no label for image {}", name);
            continue;
        };
        let label = &labels.images[idx];
        if label.shape()[..2] != image.shape()[..2] {
            warn!("label size of {} differs from its image", name);
            continue;
        }
        pairs.push((image, label.clone()));
    }
    Ok(pairs)
}

/// Upscale so that both sides are at least `min_height` x `min_width`.
///
/// The aspect ratio is kept. Images that already cover the size are
/// returned unchanged. Use `FilterType::Lanczos3` for photos and
/// `FilterType::Nearest` for label maps.
pub fn resize_to_cover(
    image: ArrayView3<u8>,
    min_height: usize,
    min_width: usize,
    filter: FilterType,
) -> Result<Array3<u8>> {
    let (h, w, c) = image.dim();
    if h == 0 || w == 0 {
        return Err(NetError::InvalidArgument("cannot resize an empty image".into()));
    }
    if h >= min_height && w >= min_width {
        return Ok(image.to_owned());
    }

    let ratio = (min_height as f64 / h as f64).max(min_width as f64 / w as f64);
    let height = ((h as f64 * ratio) as usize).max(min_height) as u32;
    let width = ((w as f64 * ratio) as usize).max(min_width) as u32;
    let raw: Vec<u8> = image.iter().copied().collect();
    let size_error = || NetError::ShapeMismatch(format!("pixel buffer does not match {:?}", (h, w, c)));

    let resized = match c {
        1 => {
            let buf = ImageBuffer::<Luma<u8>, _>::from_raw(w as u32, h as u32, raw).ok_or_else(size_error)?;
            imageops::resize(&buf, width, height, filter).into_raw()
        }
        3 => {
            let buf = ImageBuffer::<Rgb<u8>, _>::from_raw(w as u32, h as u32, raw).ok_or_else(size_error)?;
            imageops::resize(&buf, width, height, filter).into_raw()
        }
        _ => {
            return Err(NetError::InvalidArgument(format!(
                "resizing supports 1 or 3 channels, got {}",
                c
            )))
        }
    };
    Ok(Array3::from_shape_vec((height as usize, width as usize, c), resized)?)
}

/// Noisy RGB images with one bright ellipse and its `0/255` foreground mask
pub fn synthetic_foreground_images(
    num_images: usize,
    height: usize,
    width: usize,
    seed: u64,
) -> Vec<(Array3<u8>, Array3<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..num_images)
        .map(|_| {
            let cy = rng.gen_range(0.25..0.75) * height as f32;
            let cx = rng.gen_range(0.25..0.75) * width as f32;
            let ry = rng.gen_range(0.15..0.3) * height as f32;
            let rx = rng.gen_range(0.15..0.3) * width as f32;

            let mut image = Array3::<u8>::zeros((height, width, 3));
            let mut label = Array3::<u8>::zeros((height, width, 1));
            for h in 0..height {
                for w in 0..width {
                    let dy = (h as f32 + 0.5 - cy) / ry;
                    let dx = (w as f32 + 0.5 - cx) / rx;
                    let inside = dy * dy + dx * dx <= 1.0;
                    let noise: u8 = rng.gen_range(0..40);
                    if inside {
                        label[[h, w, 0]] = 255;
                        image[[h, w, 0]] = 40 + noise;
                        image[[h, w, 1]] = 200 + noise;
                        image[[h, w, 2]] = 40 + noise;
                    } else {
                        image[[h, w, 0]] = 90 + noise;
                        image[[h, w, 1]] = 70 + noise;
                        image[[h, w, 2]] = 50 + noise;
                    }
                }
            }
            (image, label)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_load_image_list_filters_by_suffix() {
        let dir = TempDir::new().unwrap();
        RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])).save(dir.path().join("b.png")).unwrap();
        RgbImage::from_pixel(4, 3, Rgb([1, 2, 3])).save(dir.path().join("a.png")).unwrap();
        GrayImage::from_pixel(4, 3, Luma([255])).save(dir.path().join("a_foreground.png")).unwrap();

        let labels = load_image_list(dir.path(), "_foreground", "png", true).unwrap();
        assert_eq!(labels.names, vec!["a".to_string()]);
        assert_eq!(labels.images[0].dim(), (3, 4, 1));

        let images = load_image_list(dir.path(), "", "png", false).unwrap();
        // "a_foreground.png" also ends with ".png" and is kept under its own stem.
        assert_eq!(images.names, vec!["a", "a_foreground", "b"]);
        assert_eq!(images.images[2][[0, 0, 2]], 30);
    }

    #[test]
    fn test_load_image_pairs() {
        let images = TempDir::new().unwrap();
        let labels = TempDir::new().unwrap();
        RgbImage::new(5, 5).save(images.path().join("p1.png")).unwrap();
        RgbImage::new(5, 5).save(images.path().join("p2.png")).unwrap();
        GrayImage::new(5, 5).save(labels.path().join("p1_fg.png")).unwrap();

        let pairs = load_image_pairs(images.path(), "", labels.path(), "_fg", "png").unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.dim(), (5, 5, 1));
    }

    #[test]
    fn test_resize_to_cover_keeps_aspect() {
        let image = Array3::<u8>::from_elem((10, 20, 3), 7);
        let resized = resize_to_cover(image.view(), 16, 16, FilterType::Nearest).unwrap();
        assert_eq!(resized.dim(), (16, 32, 3));
        assert!(resized.iter().all(|&p| p == 7));

        let big = resize_to_cover(image.view(), 5, 5, FilterType::Lanczos3).unwrap();
        assert_eq!(big.dim(), (10, 20, 3));
        assert!(resize_to_cover(Array3::<u8>::zeros((2, 2, 2)).view(), 4, 4, FilterType::Nearest).is_err());
    }

    #[test]
    fn test_synthetic_foreground_masks() {
        let pairs = synthetic_foreground_images(3, 16, 20, 9);
        assert_eq!(pairs.len(), 3);
        for (image, label) in &pairs {
            assert_eq!(image.dim(), (16, 20, 3));
            assert!(label.iter().any(|&v| v == 255));
            assert!(label.iter().any(|&v| v == 0));
        }
        assert_eq!(pairs[0].0, synthetic_foreground_images(1, 16, 20, 9)[0].0);
    }
}
