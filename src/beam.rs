use crate::model::LanguageModel;
use crate::tensor::Tensor;
use ndarray::{Array1, Array2, Axis};
use std::cmp::Ordering;

/// Breadth-limited best-first decoding over partial sequences.
///
/// Hypotheses advance in lockstep rounds, one round per emitted token;
/// each example keeps at most `beam_size` hypotheses. A hypothesis that
/// emits the end token stops extending but keeps competing for its slot
/// with an unchanged cumulative score, so exactly `seq_length` rounds run
/// for every example.
pub struct BeamSearch {
    beam_size: usize,
}

struct Hypothesis {
    tokens: Vec<i64>,
    step_log_probs: Vec<f32>,
    score: f32,
    h: Vec<Tensor>,
    c: Vec<Tensor>,
    // Log-prob distribution for the next extension; None once finished
    // (or when no further round will consume it).
    next_row: Option<Vec<f32>>,
    finished: bool,
}

struct Candidate {
    parent: usize,
    token: i64,
    log_prob: f32,
    score: f32,
    carry: bool,
}

impl BeamSearch {
    pub fn new(beam_size: usize) -> Self {
        BeamSearch { beam_size }
    }

    /// Decodes every batch item. Returns (seq_length, batch) token ids and
    /// the per-step log-probabilities of each chosen path.
    pub fn run(
        &self,
        model: &LanguageModel,
        image: &Array2<f32>,
        tags: &Array2<i64>,
    ) -> Result<(Array2<i64>, Array2<f32>), String> {
        if self.beam_size == 0 {
            return Err("beam_size must be at least 1".to_string());
        }
        let batch = image.nrows();
        let t_max = model.config().seq_length;
        let mut seq_out = Array2::<i64>::zeros((t_max, batch));
        let mut lp_out = Array2::<f32>::zeros((t_max, batch));

        for b in 0..batch {
            let best = self.search_one(model, image, tags, b)?;
            for t in 0..t_max {
                seq_out[[t, b]] = best.tokens[t];
                lp_out[[t, b]] = best.step_log_probs[t];
            }
        }
        Ok((seq_out, lp_out))
    }

    fn search_one(
        &self,
        model: &LanguageModel,
        image: &Array2<f32>,
        tags: &Array2<i64>,
        example: usize,
    ) -> Result<Hypothesis, String> {
        let t_max = model.config().seq_length;
        let end = model.end_token();

        let image_row = image.row(example).to_owned().insert_axis(Axis(0));
        let tags_row = tags.row(example).to_owned().insert_axis(Axis(0));
        let image_t = Tensor::new(image_row.into_dyn(), false);
        let tag_bank = model.tag_bank(&tags_row);

        // Seed: one hypothesis per example, scored from the image step.
        let (mut h, mut c) = model.initial_state(1);
        let step0 = model.run_step(&image_t, None, &mut h, &mut c, false);
        let mut beams = vec![Hypothesis {
            tokens: Vec::with_capacity(t_max),
            step_log_probs: Vec::with_capacity(t_max),
            score: 0.0,
            h,
            c,
            next_row: Some(flatten_row(&step0.log_probs)),
            finished: false,
        }];

        for round in 0..t_max {
            let mut candidates: Vec<Candidate> = Vec::new();
            for (i, hyp) in beams.iter().enumerate() {
                if hyp.finished {
                    // A finished hypothesis keeps its slot: it competes
                    // with an unchanged score and records padding.
                    candidates.push(Candidate {
                        parent: i,
                        token: 0,
                        log_prob: 0.0,
                        score: hyp.score,
                        carry: true,
                    });
                    continue;
                }
                let row = hyp
                    .next_row
                    .as_ref()
                    .expect("live hypothesis must carry a distribution");
                for (j, &lp) in row.iter().enumerate() {
                    candidates.push(Candidate {
                        parent: i,
                        token: j as i64 + 1,
                        log_prob: lp,
                        score: hyp.score + lp,
                        carry: false,
                    });
                }
            }

            candidates.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then(a.token.cmp(&b.token))
                    .then(a.parent.cmp(&b.parent))
            });
            candidates.truncate(self.beam_size);

            let advance = round + 1 < t_max;
            let mut next_beams: Vec<Hypothesis> = Vec::with_capacity(candidates.len());
            for cand in candidates {
                let parent = &beams[cand.parent];
                let mut tokens = parent.tokens.clone();
                let mut step_log_probs = parent.step_log_probs.clone();
                tokens.push(cand.token);
                step_log_probs.push(cand.log_prob);

                if cand.carry || cand.token == end {
                    next_beams.push(Hypothesis {
                        tokens,
                        step_log_probs,
                        score: cand.score,
                        h: parent.h.clone(),
                        c: parent.c.clone(),
                        next_row: None,
                        finished: true,
                    });
                    continue;
                }

                // The survivor inherits its parent's state advanced one
                // cell step with the chosen token's embedding.
                let mut h = parent.h.clone();
                let mut c = parent.c.clone();
                let next_row = if advance {
                    let word = model.embed_ids(Array1::from_elem(1, cand.token as f32));
                    let step = model.run_step(&word, Some(&tag_bank), &mut h, &mut c, false);
                    Some(flatten_row(&step.log_probs))
                } else {
                    None
                };
                next_beams.push(Hypothesis {
                    tokens,
                    step_log_probs,
                    score: cand.score,
                    h,
                    c,
                    next_row,
                    finished: false,
                });
            }
            beams = next_beams;
        }

        // Candidates were kept in sorted order, so the head is the best
        // hypothesis; ties already resolved deterministically.
        beams
            .into_iter()
            .next()
            .ok_or_else(|| "beam search produced no hypotheses".to_string())
    }
}

fn flatten_row(log_probs: &Tensor) -> Vec<f32> {
    log_probs.lock().data.iter().copied().collect()
}
