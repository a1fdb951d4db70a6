use image::imageops::FilterType;
use log::info;
use ndarray::{stack, Array2, Array3, ArrayView2, Axis, Ix4};

use super::{inference_net, prepare_dirs, train_and_evaluate, RunReport};
use crate::core::{LabeledData, NeuralNetPredictor, RunConfig};
use crate::data::{
    generate_image_patch_list, load_image_pairs, resize_to_cover, stitch_patch_predictions,
    synthetic_foreground_images, train_test_split, Patch, PatchConfig,
};
use crate::models::{FcDenseNet, FcDenseNetConfig};
use crate::nn::argmax_last;
use crate::utils::{compute_intersection_over_union_of_aabb, to_one_hot_encoding};
use crate::{NetError, Result};

const NUM_CLASSES: usize = 2;
/// Full-size images segmented after training
const NUM_PREDICTED_IMAGES: usize = 4;

type ImagePair = (Array3<u8>, Array3<u8>);

fn load_pairs(config: &RunConfig) -> Result<Vec<ImagePair>> {
    match &config.data_dir {
        Some(dir) => load_image_pairs(dir.join("images"), "", dir.join("labels"), "_foreground", "png"),
        None => {
            let (ph, pw) = (config.patches.patch_height, config.patches.patch_width);
            info!("no data directory; generating {} synthetic images", config.synthetic_examples);
            Ok(synthetic_foreground_images(
                config.synthetic_examples,
                ph + ph / 2,
                pw + pw / 2,
                config.training.seed,
            ))
        }
    }
}

/// Scaled images and one-hot masks; a label byte of 255 is foreground
fn to_examples(patches: &[Patch]) -> Result<LabeledData> {
    if patches.is_empty() {
        return Err(NetError::EmptyDataset);
    }
    let images: Vec<_> = patches.iter().map(|p| p.image.view()).collect();
    let images = stack(Axis(0), &images)?.mapv(|v| f32::from(v) / 255.0);

    let labels = patches
        .iter()
        .map(|p| {
            p.label
                .as_ref()
                .map(|l| l.view())
                .ok_or_else(|| NetError::InvalidArgument("patch has no label".into()))
        })
        .collect::<Result<Vec<_>>>()?;
    let labels = stack(Axis(0), &labels)?.mapv(|v| v / 255);
    LabeledData::new(images.into_dyn(), to_one_hot_encoding(&labels, Some(NUM_CLASSES))?)
}

/// `[x_min, y_min, x_max, y_max]` of the non-zero pixels
fn bounding_box(mask: ArrayView2<usize>) -> Option<[f32; 4]> {
    mask.indexed_iter()
        .filter(|&(_, &v)| v != 0)
        .fold(None, |acc: Option<[f32; 4]>, ((y, x), _)| {
            let (x, y) = (x as f32, y as f32);
            Some(match acc {
                None => [x, y, x, y],
                Some([x0, y0, x1, y1]) => [x0.min(x), y0.min(y), x1.max(x), y1.max(y)],
            })
        })
}

/// Segment whole images by predicting patches and stitching them back
fn segment(
    net: &mut FcDenseNet,
    image: &Array3<u8>,
    patch_config: &PatchConfig,
    batch_size: Option<usize>,
) -> Result<Array2<usize>> {
    let config = PatchConfig {
        foreground_ratio: None,
        ..patch_config.clone()
    };
    let patches = generate_image_patch_list(image.view(), None, &config)?;
    if patches.is_empty() {
        return Err(NetError::EmptyDataset);
    }
    let views: Vec<_> = patches.iter().map(|p| p.image.view()).collect();
    let data = stack(Axis(0), &views)?.mapv(|v| f32::from(v) / 255.0);
    let regions: Vec<_> = patches.iter().map(|p| p.region).collect();

    let scores = NeuralNetPredictor::new()
        .predict(net, &LabeledData::unlabeled(data.into_dyn())?, batch_size)?
        .into_dimensionality::<Ix4>()?;
    let (height, width, _) = image.dim();
    let stitched = stitch_patch_predictions(scores.view(), &regions, height, width)?;
    Ok(argmax_last(stitched.view()))
}

/// Train FC-DenseNet on foreground patches, then segment full-size images
pub fn run_fc_densenet(config: &RunConfig) -> Result<RunReport> {
    let dirs = prepare_dirs(config)?;
    let pairs = load_pairs(config)?;
    let (ph, pw) = (config.patches.patch_height, config.patches.patch_width);

    let mut patches = Vec::new();
    for (image, label) in &pairs {
        patches.extend(generate_image_patch_list(image.view(), Some(label.view()), &config.patches)?);
    }
    info!("{} patches from {} images", patches.len(), pairs.len());
    let examples = to_examples(&patches)?;
    drop(patches);
    let (train, test) = train_test_split(&examples, config.validation_split, config.training.seed)?;

    let model_config = FcDenseNetConfig {
        in_channels: 3,
        num_classes: NUM_CLASSES,
        ..config.fc_densenet.clone()
    };
    let make = || FcDenseNet::new(model_config.clone());
    let (history, evaluation) = train_and_evaluate(&make, config, &dirs, &train, &test)?;

    let mut net = inference_net(&make, &dirs)?;
    let mut inferences = Vec::new();
    for (i, (image, label)) in pairs.iter().take(NUM_PREDICTED_IMAGES).enumerate() {
        let image = resize_to_cover(image.view(), ph, pw, FilterType::Lanczos3)?;
        let label = resize_to_cover(label.view(), ph, pw, FilterType::Nearest)?;
        let truth = label.index_axis(Axis(2), 0).mapv(|v| usize::from(v / 255));

        let prediction = segment(&mut net, &image, &config.patches, config.eval_batch_size)?;
        let correct = prediction.iter().zip(truth.iter()).filter(|(p, t)| p == t).count();
        let pixel_accuracy = correct as f32 / truth.len() as f32;
        let iou = match (bounding_box(prediction.view()), bounding_box(truth.view())) {
            (Some(a), Some(b)) => compute_intersection_over_union_of_aabb(a, b),
            _ => 0.0,
        };

        let line = format!("image {}: pixel accuracy {:.4}, box IoU {:.4}", i, pixel_accuracy, iou);
        info!("{}", line);
        inferences.push(line);
    }

    Ok(RunReport {
        dirs,
        history,
        evaluation,
        inferences,
    })
}
