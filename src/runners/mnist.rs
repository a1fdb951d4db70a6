use log::info;
use ndarray::{s, Ix2, Ix4};

use super::{inference_net, prepare_dirs, train_and_evaluate, RunReport};
use crate::core::{ExampleSet, LabeledData, NeuralNetPredictor, RunConfig};
use crate::data::{load_mnist, synthetic_digits, train_test_split};
use crate::models::CnnModel;
use crate::nn::categorical_accuracy;
use crate::utils::{save_json, visualize_by_partial_occlusion, OcclusionGrid};
use crate::{NetError, Result};

/// Images whose occlusion maps are written after inference
const OCCLUSION_IMAGES: usize = 4;

fn load_data(config: &RunConfig) -> Result<(LabeledData, LabeledData)> {
    match &config.data_dir {
        Some(dir) => {
            let mnist = load_mnist(dir)?;
            Ok((mnist.train, mnist.test))
        }
        None => {
            info!("no data directory; generating {} synthetic digits", config.synthetic_examples);
            let digits = synthetic_digits(config.synthetic_examples, config.training.seed)?;
            train_test_split(&digits, config.validation_split, config.training.seed)
        }
    }
}

/// Train and evaluate the CNN on MNIST (or synthetic digits), then report
/// test accuracy of the inference net and save occlusion maps
pub fn run_mnist(config: &RunConfig) -> Result<RunReport> {
    let dirs = prepare_dirs(config)?;
    let (train, test) = load_data(config)?;
    let make = || CnnModel::new(config.cnn.clone());

    let (history, evaluation) = train_and_evaluate(&make, config, &dirs, &train, &test)?;

    let mut net = inference_net(&make, &dirs)?;
    let predictions = NeuralNetPredictor::new()
        .predict(&mut net, &test.clone().into_inputs(), config.eval_batch_size)?
        .into_dimensionality::<Ix2>()?;
    let labels = test
        .labels
        .as_ref()
        .ok_or_else(|| NetError::InvalidArgument("test data has no labels".into()))?
        .view()
        .into_dimensionality::<Ix2>()?;
    let accuracy = categorical_accuracy(predictions.view(), labels)?;
    info!("inference accuracy on {} examples: {:.4}", test.num_examples(), accuracy);

    let shown = OCCLUSION_IMAGES.min(test.num_examples());
    let images = test.data.view().into_dimensionality::<Ix4>()?;
    let grid = OcclusionGrid {
        grid_counts: (7, 7),
        occlusion_size: (6, 6),
        occlusion_color: 0.0,
    };
    let maps = visualize_by_partial_occlusion(
        &mut net,
        images.slice(s![..shown, .., .., ..]),
        labels.slice(s![..shown, ..]),
        &grid,
        config.eval_batch_size,
    )?;
    save_json(&maps, dirs.inference.join("occlusion.json"))?;

    Ok(RunReport {
        dirs,
        history,
        evaluation,
        inferences: vec![format!("accuracy {:.4}", accuracy)],
    })
}
