use caption_engine::{
    AttentionCoverage, Criterion, CriterionList, LanguageModel, ModelConfig, SequenceCrossEntropy,
};
use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn scenario_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 5,
        word_encoding_size: 11,
        image_encoding_size: 11,
        rnn_size: 8,
        num_layers: 1,
        dropout: 0.0,
        seq_length: 7,
        batch_size: 10,
    }
}

// The reference masking scenario: batch 10, columns 1 and 6 (1-indexed)
// padded starting at rows 4 and 5. In 0-indexed terms columns 0 and 5 pad
// from rows 3 and 4.
fn scenario_targets(config: &ModelConfig, seed: u64) -> Array2<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut seq = Array2::from_shape_fn((config.seq_length, 10), |_| {
        rng.gen_range(1..=config.vocab_size as i64)
    });
    for t in 3..config.seq_length {
        seq[[t, 0]] = 0;
    }
    for t in 4..config.seq_length {
        seq[[t, 5]] = 0;
    }
    seq
}

fn forward_outputs(
    config: &ModelConfig,
    seq: &Array2<i64>,
    seed: u64,
) -> (LanguageModel, ArrayD<f32>, ArrayD<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = LanguageModel::seeded(config, seed).expect("create model");
    let image = Array2::from_shape_fn((10, config.image_encoding_size), |_| {
        rng.gen_range(-1.0f32..1.0)
    });
    let tags = Array2::from_shape_fn((10, 3), |_| rng.gen_range(1..=config.vocab_size as i64));
    let (log_probs, attention) = model.forward(&image, Some(seq), &tags).expect("forward");
    (model, log_probs, attention)
}

#[test]
fn gradient_mask_matches_padding_rows() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 31);
    let (_, log_probs, _) = forward_outputs(&config, &seq, 31);

    let criterion = SequenceCrossEntropy::new();
    let grad = criterion.loss_gradient(&log_probs, &seq).expect("gradient");
    assert_eq!(grad.shape(), log_probs.shape());

    // Column 0 (1-indexed 1): padding starts at 1-indexed row 4, so the
    // END marker is supervised there and 1-indexed rows 5..8 are exactly
    // zero; 0-indexed that is rows 4..=7.
    for t in 4..8 {
        for class in 0..6 {
            assert_eq!(
                grad[[t, 0, class]],
                0.0,
                "expected exact zero at row {} col 0 class {}",
                t,
                class
            );
        }
    }
    // The END row itself carries gradient.
    assert!(grad[[3, 0, 5]] != 0.0, "END row must carry loss gradient");

    // Column 5 (1-indexed 6): padding from 1-indexed row 5; zeros at rows
    // 6..8 (0-indexed 5..=7).
    for t in 5..8 {
        for class in 0..6 {
            assert_eq!(grad[[t, 5, class]], 0.0);
        }
    }
    assert!(grad[[4, 5, 5]] != 0.0, "END row must carry loss gradient");

    // A full-length column is supervised at every row including the final
    // END row.
    let mut nonzero_rows = 0;
    for t in 0..8 {
        let mut any = false;
        for class in 0..6 {
            if grad[[t, 1, class]] != 0.0 {
                any = true;
            }
        }
        if any {
            nonzero_rows += 1;
        }
    }
    assert_eq!(nonzero_rows, 8);
}

#[test]
fn gradient_entries_are_uniform_negative_reciprocal() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 37);
    let (_, log_probs, _) = forward_outputs(&config, &seq, 37);

    let criterion = SequenceCrossEntropy::new();
    let grad = criterion.loss_gradient(&log_probs, &seq).expect("gradient");

    // Counted positions: 8 full columns * 8 rows + (3 tokens + END) +
    // (4 tokens + END).
    let expected_count = 8 * 8 + 4 + 5;
    let mut seen = 0;
    for &v in grad.iter() {
        if v != 0.0 {
            seen += 1;
            assert!(
                (v + 1.0 / expected_count as f32).abs() < 1e-7,
                "per-position gradient must be -1/count, got {}",
                v
            );
        }
    }
    assert_eq!(seen, expected_count);
}

#[test]
fn loss_averages_over_counted_positions() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 41);
    let (_, log_probs, _) = forward_outputs(&config, &seq, 41);

    let criterion = SequenceCrossEntropy::new();
    let loss = criterion.loss(&log_probs, &seq).expect("loss");
    assert!(loss > 0.0);
    // Untrained log-probs hover around the uniform distribution.
    assert!(loss < 4.0, "untrained masked loss unexpectedly large: {}", loss);
}

#[test]
fn backward_returns_image_gradient_and_empty_integer_gradients() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 43);
    let (mut model, log_probs, attention) = forward_outputs(&config, &seq, 43);

    let criterion = SequenceCrossEntropy::new();
    let grad_lp = criterion.loss_gradient(&log_probs, &seq).expect("gradient");
    let grad_at = ArrayD::<f32>::zeros(attention.dim());

    let grads = model.backward(&grad_lp, &grad_at).expect("backward");
    assert_eq!(grads.image.shape(), &[10, 11]);
    assert_eq!(grads.sequence.len(), 0, "sequence gradient must be empty");
    assert_eq!(grads.semantic_words.len(), 0, "tag gradient must be empty");
    assert!(
        grads.image.iter().any(|v| *v != 0.0),
        "image gradient should be nonzero for a supervised batch"
    );

    // Parameters accumulated gradients.
    assert!(model.gradients_flat().iter().any(|v| *v != 0.0));

    // The placeholder embedding row is only fed at loss-masked steps, so
    // with a zero attention gradient it must receive no gradient at all.
    let table_grad = model
        .embedding
        .weight
        .lock()
        .grad
        .clone()
        .expect("embedding gradient");
    for j in 0..11 {
        assert_eq!(table_grad[[0, j]], 0.0);
    }

    // A second backward without a fresh forward is rejected.
    assert!(model.backward(&grad_lp, &grad_at).is_err());
}

#[test]
fn backward_rejects_mismatched_gradient_shapes() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 47);
    let (mut model, _, attention) = forward_outputs(&config, &seq, 47);

    let bad = ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 2, 2]));
    let grad_at = ArrayD::<f32>::zeros(attention.dim());
    assert!(model.backward(&bad, &grad_at).is_err());
}

#[test]
fn coverage_penalty_gradient_is_shape_matched_and_masked_at_step_zero() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 53);
    let (_, _, attention) = forward_outputs(&config, &seq, 53);

    let coverage = AttentionCoverage::new();
    let penalty = coverage.penalty(&attention).expect("penalty");
    assert!(penalty >= 0.0);

    let grad = coverage.penalty_gradient(&attention).expect("gradient");
    assert_eq!(grad.shape(), attention.shape());
    let shape = attention.shape().to_vec();
    for b in 0..shape[1] {
        for k in 0..shape[2] {
            assert_eq!(
                grad[[0, b, k]],
                0.0,
                "image-step trace row is constant and must carry no gradient"
            );
        }
    }
}

#[test]
fn criterion_list_combines_losses_and_gradients() {
    let config = scenario_config();
    let seq = scenario_targets(&config, 59);
    let (_, log_probs, attention) = forward_outputs(&config, &seq, 59);

    let seq_loss = SequenceCrossEntropy::new();
    let coverage = AttentionCoverage::new();
    let l1 = seq_loss.loss(&log_probs, &seq).unwrap();
    let l2 = coverage.penalty(&attention).unwrap();

    let combined = CriterionList::new()
        .add(Box::new(SequenceCrossEntropy::new()), 1.0)
        .add(Box::new(AttentionCoverage::new()), 0.5);
    let total = combined.forward(&log_probs, &attention, &seq).unwrap();
    assert!((total - (l1 + 0.5 * l2)).abs() < 1e-6);

    let (g_lp, g_at) = combined.gradient(&log_probs, &attention, &seq).unwrap();
    let g1 = seq_loss.loss_gradient(&log_probs, &seq).unwrap();
    let g2 = coverage.penalty_gradient(&attention).unwrap();
    for (a, b) in g_lp.iter().zip(g1.iter()) {
        assert!((a - b).abs() < 1e-7);
    }
    for (a, b) in g_at.iter().zip(g2.iter()) {
        assert!((a - 0.5 * b).abs() < 1e-7);
    }
}
