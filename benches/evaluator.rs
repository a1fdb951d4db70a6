use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nn_runner::core::{ExampleSet, NeuralNet, NeuralNetEvaluator, NeuralNetPredictor};
use nn_runner::data::synthetic_digits;
use nn_runner::models::{CnnConfig, CnnModel};

fn small_cnn() -> CnnModel {
    let config = CnnConfig {
        conv1_filters: 4,
        conv2_filters: 8,
        hidden_units: 32,
        ..CnnConfig::default()
    };
    let mut net = CnnModel::new(config).unwrap();
    net.create_evaluation_model().unwrap();
    net
}

fn bench_evaluate(c: &mut Criterion) {
    let data = synthetic_digits(64, 0).unwrap();
    let mut net = small_cnn();
    let evaluator = NeuralNetEvaluator::new();

    c.bench_function("evaluate_64_batch_16", |b| {
        b.iter(|| evaluator.evaluate(&mut net, black_box(&data), Some(16)).unwrap())
    });
    c.bench_function("evaluate_64_single_pass", |b| {
        b.iter(|| evaluator.evaluate(&mut net, black_box(&data), None).unwrap())
    });
}

fn bench_predict(c: &mut Criterion) {
    let data = synthetic_digits(64, 1).unwrap().into_inputs();
    let mut net = small_cnn();
    let predictor = NeuralNetPredictor::new();

    c.bench_function("predict_64_batch_16", |b| {
        b.iter(|| predictor.predict(&mut net, black_box(&data), Some(16)).unwrap())
    });
}

criterion_group!(benches, bench_evaluate, bench_predict);
criterion_main!(benches);
