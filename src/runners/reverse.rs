use log::info;
use ndarray::Ix3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{inference_net, prepare_dirs, train_and_evaluate, RunReport};
use crate::core::{NeuralNetPredictor, RunConfig, SequencePairs};
use crate::data::ReverseFunctionDataset;
use crate::models::{EncoderDecoder, EncoderDecoderConfig};
use crate::Result;

/// Strings decoded by the inference net after training
const NUM_TEST_STRINGS: usize = 6;

/// Train the encoder-decoder to reverse strings, evaluate it with teacher
/// forcing and decode fresh strings greedily
pub fn run_reverse_function(config: &RunConfig) -> Result<RunReport> {
    let dirs = prepare_dirs(config)?;
    let dataset = ReverseFunctionDataset::new(&config.reverse.characters, config.reverse.max_token_len)?;
    let (train, val) = dataset.generate_dataset(&config.reverse)?;

    let model_config = EncoderDecoderConfig {
        vocab_size: dataset.vocab_size(),
        output_length: dataset.max_token_len(),
        ..config.encoder_decoder.clone()
    };
    let make = || EncoderDecoder::new(model_config.clone());

    let (history, evaluation) = train_and_evaluate(&make, config, &dirs, &train, &val)?;

    let mut rng = StdRng::seed_from_u64(config.reverse.seed.wrapping_add(1));
    let test_strs = dataset.random_strings(NUM_TEST_STRINGS, &mut rng);
    let inputs = SequencePairs::encoder_only(dataset.to_numeric_data(&test_strs)?.into_dyn())?;

    let mut net = inference_net(&make, &dirs)?;
    let outputs = NeuralNetPredictor::new()
        .infer(&mut net, &inputs, config.eval_batch_size)?
        .into_dimensionality::<Ix3>()?;
    let inferred = dataset.to_char_strings(outputs.view());

    let inferences = test_strs
        .iter()
        .zip(&inferred)
        .map(|(input, output)| format!("{} -> {}", input, output))
        .collect::<Vec<_>>();
    for line in &inferences {
        info!("{}", line);
    }

    Ok(RunReport {
        dirs,
        history,
        evaluation,
        inferences,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::tests::tiny_config;
    use crate::data::ReverseFunctionConfig;
    use tempfile::TempDir;

    #[test]
    fn test_reverse_function_run() {
        let root = TempDir::new().unwrap();
        let mut config = tiny_config(root.path(), "reverse_function_encdec");
        config.reverse = ReverseFunctionConfig {
            max_token_len: 3,
            num_examples: 30,
            ..ReverseFunctionConfig::default()
        };
        config.encoder_decoder.hidden_size = 6;

        let report = run_reverse_function(&config).unwrap();
        assert_eq!(report.inferences.len(), NUM_TEST_STRINGS);
        assert!(report.inferences.iter().all(|line| line.contains(" -> ")));
        assert!((0.0..=1.0).contains(&report.evaluation.accuracy));
        assert!(report.evaluation.loss.is_finite());
    }
}
