use caption_engine::nn::{Adam, Optimizer};
use caption_engine::{LanguageModel, ModelConfig, SequenceCrossEntropy};
use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn toy_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 5,
        word_encoding_size: 16,
        image_encoding_size: 16,
        rnn_size: 24,
        num_layers: 1,
        dropout: 0.0,
        seq_length: 7,
        batch_size: 6,
    }
}

fn toy_batch(config: &ModelConfig) -> (Array2<f32>, Array2<i64>, Array2<i64>) {
    let mut rng = StdRng::seed_from_u64(4242);
    let image = Array2::from_shape_fn((6, config.image_encoding_size), |_| {
        rng.gen_range(-1.0f32..1.0)
    });
    let tags = Array2::from_shape_fn((6, 2), |_| rng.gen_range(1..=config.vocab_size as i64));
    let mut seq = Array2::from_shape_fn((config.seq_length, 6), |_| {
        rng.gen_range(1..=config.vocab_size as i64)
    });
    // A couple of short sequences keep the masking path honest.
    for t in 4..config.seq_length {
        seq[[t, 2]] = 0;
    }
    for t in 5..config.seq_length {
        seq[[t, 4]] = 0;
    }
    (image, tags, seq)
}

// Thirty adaptive-rate iterations must take the toy batch from the
// uniform-distribution loss (ln 6) down into memorization.
#[test]
fn overfits_toy_batch_in_thirty_iterations() {
    let config = toy_config();
    let mut model = LanguageModel::seeded(&config, 4242).expect("create model");
    let (image, tags, seq) = toy_batch(&config);

    let criterion = SequenceCrossEntropy::new();
    let params = model.parameters();
    let mut optimizer = Adam::new(0.1, 0.9, 0.999, 1e-8);

    let mut first_loss = None;
    let mut last_loss = f32::INFINITY;
    for _ in 0..30 {
        model.zero_grad();
        let (log_probs, attention) = model.forward(&image, Some(&seq), &tags).expect("forward");
        let loss = criterion.loss(&log_probs, &seq).expect("loss");
        if first_loss.is_none() {
            first_loss = Some(loss);
        }
        last_loss = loss;

        let grad_lp = criterion.loss_gradient(&log_probs, &seq).expect("gradient");
        let grad_at = ArrayD::<f32>::zeros(attention.dim());
        model.backward(&grad_lp, &grad_at).expect("backward");
        optimizer.step(&params);
    }

    let first_loss = first_loss.unwrap();
    assert!(
        (first_loss - (6.0f32).ln()).abs() < 0.7,
        "initial loss should sit near ln(6): {}",
        first_loss
    );
    assert!(
        last_loss < 0.2,
        "loss failed to drop below 0.2 after 30 iterations: {} -> {}",
        first_loss,
        last_loss
    );
}

#[test]
fn zero_grad_clears_accumulated_gradients() {
    let config = toy_config();
    let mut model = LanguageModel::seeded(&config, 7).expect("create model");
    let (image, tags, seq) = toy_batch(&config);

    let criterion = SequenceCrossEntropy::new();
    let (log_probs, attention) = model.forward(&image, Some(&seq), &tags).expect("forward");
    let grad_lp = criterion.loss_gradient(&log_probs, &seq).expect("gradient");
    let grad_at = ArrayD::<f32>::zeros(attention.dim());
    model.backward(&grad_lp, &grad_at).expect("backward");

    assert!(model.gradients_flat().iter().any(|v| *v != 0.0));
    model.zero_grad();
    assert!(model.gradients_flat().iter().all(|v| *v == 0.0));
}

#[test]
fn flat_parameter_round_trip_is_lossless() {
    let config = toy_config();
    let mut model = LanguageModel::seeded(&config, 11).expect("create model");

    let flat = model.parameters_flat();
    assert_eq!(flat.len(), model.gradients_flat().len());

    model.set_parameters_flat(&flat).expect("set parameters");
    assert_eq!(model.parameters_flat(), flat);

    // A wrong-sized vector is rejected before any write.
    assert!(model.set_parameters_flat(&flat[1..]).is_err());
    assert_eq!(model.parameters_flat(), flat);
}

#[test]
fn one_optimizer_step_reduces_the_loss() {
    let config = toy_config();
    let mut model = LanguageModel::seeded(&config, 13).expect("create model");
    let (image, tags, seq) = toy_batch(&config);

    let criterion = SequenceCrossEntropy::new();
    let params = model.parameters();
    let mut optimizer = Adam::new(0.05, 0.9, 0.999, 1e-8);

    model.zero_grad();
    let (log_probs, attention) = model.forward(&image, Some(&seq), &tags).expect("forward");
    let loss0 = criterion.loss(&log_probs, &seq).expect("loss");
    let grad_lp = criterion.loss_gradient(&log_probs, &seq).expect("gradient");
    model
        .backward(&grad_lp, &ArrayD::<f32>::zeros(attention.dim()))
        .expect("backward");
    optimizer.clip_gradients(&params, 5.0);
    optimizer.step(&params);

    let (log_probs, _) = model.forward(&image, Some(&seq), &tags).expect("forward");
    let loss1 = criterion.loss(&log_probs, &seq).expect("loss");
    assert!(
        loss1 < loss0,
        "loss must decrease after one optimization step: {} -> {}",
        loss0,
        loss1
    );
}
