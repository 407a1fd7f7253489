use crate::beam::BeamSearch;
use crate::nn::{Embedding, Linear, LstmCell, Module, TagAttention};
use crate::tensor::Tensor;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Model hyperparameters.
///
/// `batch_size` is informational (collaborating training loops size their
/// batches from it); the shapes actually processed come from the inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub word_encoding_size: usize,
    pub image_encoding_size: usize,
    pub rnn_size: usize,
    pub num_layers: usize,
    pub dropout: f32,
    pub seq_length: usize,
    pub batch_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            vocab_size: 1000,
            word_encoding_size: 256,
            image_encoding_size: 256,
            rnn_size: 256,
            num_layers: 1,
            dropout: 0.5,
            seq_length: 16,
            batch_size: 16,
        }
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.vocab_size == 0 {
            return Err("vocab_size must be positive".to_string());
        }
        if self.rnn_size == 0 || self.word_encoding_size == 0 || self.seq_length == 0 {
            return Err("rnn_size, word_encoding_size and seq_length must be positive".to_string());
        }
        if self.num_layers == 0 {
            return Err("num_layers must be at least 1".to_string());
        }
        if self.image_encoding_size != self.word_encoding_size {
            return Err(format!(
                "image_encoding_size ({}) must equal word_encoding_size ({}): the image vector is fed directly as the first step's input encoding",
                self.image_encoding_size, self.word_encoding_size
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(format!("dropout must lie in [0, 1): {}", self.dropout));
        }
        Ok(())
    }
}

/// Decoding options for [`LanguageModel::sample`].
#[derive(Clone, Debug)]
pub struct SampleOptions {
    pub beam_size: usize,
}

impl Default for SampleOptions {
    fn default() -> Self {
        SampleOptions { beam_size: 1 }
    }
}

/// Gradients returned by [`LanguageModel::backward`].
///
/// The integer-valued inputs (token sequence, semantic words) are not
/// differentiable; their gradients are reported as empty arrays.
pub struct ModelGradients {
    pub image: Array2<f32>,
    pub sequence: ArrayD<f32>,
    pub semantic_words: ArrayD<f32>,
}

// Graph roots recorded by the latest forward pass, consumed by backward.
struct ForwardState {
    log_probs: Tensor,
    attention: Tensor,
    image: Tensor,
}

pub(crate) struct StepOutput {
    pub log_probs: Tensor,
    pub weights: Option<Tensor>,
}

/// Recurrent caption language model with attention over semantic tags.
///
/// The unroll runs seq_length+1 steps: step 0 consumes the image encoding,
/// the remaining steps consume the previous (teacher-forced or sampled)
/// word embedding together with an attention context over the tag bank.
pub struct LanguageModel {
    config: ModelConfig,
    pub embedding: Embedding,
    pub cells: Vec<LstmCell>,
    pub attention: TagAttention,
    pub output: Linear,
    training: bool,
    state: Option<ForwardState>,
}

impl LanguageModel {
    /// Creates a model with freshly initialized parameters.
    pub fn new(config: &ModelConfig) -> Result<Self, String> {
        let mut rng = rand::thread_rng();
        Self::init(config, &mut rng)
    }

    /// Creates a model with reproducible parameter initialization.
    pub fn seeded(config: &ModelConfig, seed: u64) -> Result<Self, String> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::init(config, &mut rng)
    }

    fn init<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<Self, String> {
        config.validate()?;
        let e = config.word_encoding_size;
        let h = config.rnn_size;
        let embedding = Embedding::new(config.vocab_size, e, rng);
        let mut cells = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            // Layer 0 sees [input encoding ++ attention context].
            let input_dim = if layer == 0 { e + e } else { h };
            cells.push(LstmCell::new(input_dim, h, rng));
        }
        let attention = TagAttention::new(h, e, rng);
        let output = Linear::new(h, config.vocab_size + 1, true, rng);
        Ok(LanguageModel {
            config: config.clone(),
            embedding,
            cells,
            attention,
            output,
            training: true,
            state: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Switches dropout on (training) or off (evaluation). Sampling never
    /// applies dropout regardless of this flag.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// The reserved sequence-end token id.
    pub fn end_token(&self) -> i64 {
        self.config.vocab_size as i64 + 1
    }

    /// Teacher-forced forward pass.
    ///
    /// `image` is (batch, image_encoding_size); `seq` is the right-padded
    /// target sequence (seq_length, batch) or `None` (all steps then feed
    /// the placeholder embedding); `tags` is (batch, K). Returns the
    /// log-probability tensor (seq_length+1, batch, vocab_size+1) and the
    /// attention trace (seq_length+1, batch, K).
    pub fn forward(
        &mut self,
        image: &Array2<f32>,
        seq: Option<&Array2<i64>>,
        tags: &Array2<i64>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        let batch = self.check_inputs(image, seq, tags)?;
        let t_max = self.config.seq_length;
        let k = tags.ncols();

        let image_t = Tensor::new(image.clone().into_dyn(), true);
        let tag_bank = self.tag_bank(tags);
        let (mut h, mut c) = self.initial_state(batch);

        let mut rows: Vec<Tensor> = Vec::with_capacity(t_max + 1);
        let mut traces: Vec<Tensor> = Vec::with_capacity(t_max + 1);

        // Step 0: the image is the input encoding; no previous word and no
        // attention, so the trace row is the uniform distribution.
        let step0 = self.run_step(&image_t, None, &mut h, &mut c, self.training);
        rows.push(step0.log_probs);
        traces.push(Tensor::new(
            ArrayD::from_elem(IxDyn(&[batch, k]), 1.0 / k as f32),
            false,
        ));

        for t in 1..=t_max {
            let mut ids = Array1::<f32>::zeros(batch);
            if let Some(seq) = seq {
                for b in 0..batch {
                    // Padding feeds the placeholder row so the batch keeps
                    // its width; those outputs are loss-masked downstream.
                    ids[b] = seq[[t - 1, b]] as f32;
                }
            }
            let ids_t = Tensor::new(ids.into_dyn(), false);
            let word = self.embedding.lookup(&ids_t);
            let step = self.run_step(&word, Some(&tag_bank), &mut h, &mut c, self.training);
            rows.push(step.log_probs);
            traces.push(step.weights.expect("attention step must produce weights"));
        }

        let log_probs = Tensor::stack(&rows, 0);
        let attention = Tensor::stack(&traces, 0);

        let log_probs_arr = log_probs.to_array();
        let attention_arr = attention.to_array();
        debug_assert!(
            log_probs_arr.iter().all(|v| *v < 0.0),
            "log-probabilities must be strictly negative"
        );

        self.state = Some(ForwardState {
            log_probs,
            attention,
            image: image_t,
        });
        Ok((log_probs_arr, attention_arr))
    }

    /// Backpropagates caller-supplied gradients for the two forward
    /// outputs through the recorded unroll.
    ///
    /// Parameter gradients accumulate on the parameter tensors (the caller
    /// zeroes them between iterations); the returned gradients cover the
    /// model inputs, with empty arrays for the non-differentiable integer
    /// inputs.
    pub fn backward(
        &mut self,
        grad_log_probs: &ArrayD<f32>,
        grad_attention: &ArrayD<f32>,
    ) -> Result<ModelGradients, String> {
        let state = self
            .state
            .take()
            .ok_or_else(|| "backward called without a preceding forward".to_string())?;

        {
            let expected = state.log_probs.lock().data.shape().to_vec();
            if grad_log_probs.shape() != expected.as_slice() {
                return Err(format!(
                    "grad_log_probs shape {:?} does not match output shape {:?}",
                    grad_log_probs.shape(),
                    expected
                ));
            }
        }
        {
            let expected = state.attention.lock().data.shape().to_vec();
            if grad_attention.shape() != expected.as_slice() {
                return Err(format!(
                    "grad_attention shape {:?} does not match trace shape {:?}",
                    grad_attention.shape(),
                    expected
                ));
            }
        }

        state.log_probs.lock().grad = Some(grad_log_probs.clone());
        state.attention.lock().grad = Some(grad_attention.clone());
        Tensor::run_backward(&[state.log_probs.clone(), state.attention.clone()]);

        let image_grad = {
            let mut lock = state.image.lock();
            let shape = lock.data.shape().to_vec();
            lock.grad
                .take()
                .unwrap_or_else(|| ArrayD::zeros(IxDyn(&shape)))
        };
        let image = image_grad
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| format!("image gradient dimensionality error: {}", e))?;

        Ok(ModelGradients {
            image,
            sequence: ArrayD::zeros(IxDyn(&[0])),
            semantic_words: ArrayD::zeros(IxDyn(&[0])),
        })
    }

    /// Decodes a sequence for each batch item, greedily or with beam
    /// search. Returns (seq_length, batch) token ids and the matching
    /// per-step log-probabilities.
    pub fn sample(
        &self,
        image: &Array2<f32>,
        tags: &Array2<i64>,
        options: &SampleOptions,
    ) -> Result<(Array2<i64>, Array2<f32>), String> {
        self.check_inputs(image, None, tags)?;
        match options.beam_size {
            0 => Err("beam_size must be at least 1".to_string()),
            1 => Ok(self.greedy_sample(image, tags)),
            k => BeamSearch::new(k).run(self, image, tags),
        }
    }

    fn greedy_sample(&self, image: &Array2<f32>, tags: &Array2<i64>) -> (Array2<i64>, Array2<f32>) {
        let batch = image.nrows();
        let t_max = self.config.seq_length;
        let end = self.end_token();

        let image_t = Tensor::new(image.clone().into_dyn(), false);
        let tag_bank = self.tag_bank(tags);
        let (mut h, mut c) = self.initial_state(batch);

        let mut seq_out = Array2::<i64>::zeros((t_max, batch));
        let mut lp_out = Array2::<f32>::zeros((t_max, batch));
        let mut ended = vec![false; batch];

        let mut step = self.run_step(&image_t, None, &mut h, &mut c, false);
        for t in 0..t_max {
            let row = step.log_probs.to_array();
            let row = row
                .view()
                .into_dimensionality::<ndarray::Ix2>()
                .expect("step log-probs must be 2D")
                .to_owned();
            let mut next_ids = Array1::<f32>::zeros(batch);
            for b in 0..batch {
                if ended[b] {
                    // Already terminated: emit padding, feed the
                    // placeholder embedding to keep the batch in lockstep.
                    continue;
                }
                let (arg, lp) = argmax_row(&row.row(b));
                let token = arg as i64 + 1;
                seq_out[[t, b]] = token;
                lp_out[[t, b]] = lp;
                next_ids[b] = token as f32;
                if token == end {
                    ended[b] = true;
                }
            }
            if t + 1 < t_max {
                let ids_t = Tensor::new(next_ids.into_dyn(), false);
                let word = self.embedding.lookup(&ids_t);
                step = self.run_step(&word, Some(&tag_bank), &mut h, &mut c, false);
            }
        }
        (seq_out, lp_out)
    }

    /// All learned parameter tensors, in a stable order.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.embedding.parameters();
        for cell in &self.cells {
            params.extend(cell.parameters());
        }
        params.extend(self.attention.parameters());
        params.extend(self.output.parameters());
        params
    }

    /// Flattens all parameters into a single vector.
    pub fn parameters_flat(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for p in self.parameters() {
            out.extend(p.lock().data.iter().copied());
        }
        out
    }

    /// Flattens all parameter gradients into a single vector, matching
    /// [`Self::parameters_flat`] element for element (zeros where no
    /// gradient has been accumulated).
    pub fn gradients_flat(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for p in self.parameters() {
            let lock = p.lock();
            match &lock.grad {
                Some(g) => out.extend(g.iter().copied()),
                None => out.extend(std::iter::repeat(0.0).take(lock.data.len())),
            }
        }
        out
    }

    /// Overwrites all parameters from a flat vector.
    pub fn set_parameters_flat(&mut self, values: &[f32]) -> Result<(), String> {
        let params = self.parameters();
        let needed: usize = params.iter().map(|p| p.lock().data.len()).sum();
        if values.len() != needed {
            return Err(format!(
                "parameter vector has {} values, model needs {}",
                values.len(),
                needed
            ));
        }
        let mut pos = 0;
        for p in params {
            let mut lock = p.lock();
            let len = lock.data.len();
            for (dst, src) in lock.data.iter_mut().zip(&values[pos..pos + len]) {
                *dst = *src;
            }
            pos += len;
        }
        Ok(())
    }

    /// Clears all accumulated parameter gradients.
    pub fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }

    // ---- step-level internals shared with the beam decoder ----

    pub(crate) fn tag_bank(&self, tags: &Array2<i64>) -> Tensor {
        let ids = tags.mapv(|v| v as f32).into_dyn();
        self.embedding.lookup(&Tensor::new(ids, false))
    }

    pub(crate) fn embed_ids(&self, ids: Array1<f32>) -> Tensor {
        self.embedding.lookup(&Tensor::new(ids.into_dyn(), false))
    }

    pub(crate) fn initial_state(&self, batch: usize) -> (Vec<Tensor>, Vec<Tensor>) {
        let h = (0..self.config.num_layers)
            .map(|_| Tensor::zeros(&[batch, self.config.rnn_size], false))
            .collect();
        let c = (0..self.config.num_layers)
            .map(|_| Tensor::zeros(&[batch, self.config.rnn_size], false))
            .collect();
        (h, c)
    }

    /// Runs one decoding step in place, updating the hidden-state bundle.
    ///
    /// `encoding` is the step input (image encoding or word embedding),
    /// (batch, word_encoding_size). With `tag_bank` present the attention
    /// context is computed from the previous top hidden state; otherwise
    /// (step 0) a zero context is fed and no weights are produced.
    pub(crate) fn run_step(
        &self,
        encoding: &Tensor,
        tag_bank: Option<&Tensor>,
        h: &mut Vec<Tensor>,
        c: &mut Vec<Tensor>,
        apply_dropout: bool,
    ) -> StepOutput {
        let batch = encoding.lock().data.shape()[0];
        let e = self.config.word_encoding_size;
        let dropout = self.config.dropout;

        let enc = if apply_dropout {
            encoding.dropout(dropout, true)
        } else {
            encoding.clone()
        };

        let (context, weights) = match tag_bank {
            Some(tags) => {
                let (ctx, w) = self.attention.forward(&h[h.len() - 1], tags);
                (ctx, Some(w))
            }
            None => (Tensor::zeros(&[batch, e], false), None),
        };

        let mut x = Tensor::concat(&[enc, context], 1);
        for layer in 0..self.cells.len() {
            let (new_h, new_c) = self.cells[layer].forward_step(&x, &h[layer], &c[layer]);
            x = new_h.clone();
            h[layer] = new_h;
            c[layer] = new_c;
        }

        let top = if apply_dropout {
            x.dropout(dropout, true)
        } else {
            x
        };
        let log_probs = self.output.forward(&top).log_softmax(1);
        StepOutput { log_probs, weights }
    }

    fn check_inputs(
        &self,
        image: &Array2<f32>,
        seq: Option<&Array2<i64>>,
        tags: &Array2<i64>,
    ) -> Result<usize, String> {
        let batch = image.nrows();
        if batch == 0 {
            return Err("batch must not be empty".to_string());
        }
        if image.ncols() != self.config.image_encoding_size {
            return Err(format!(
                "image encoding width {} does not match configured image_encoding_size {}",
                image.ncols(),
                self.config.image_encoding_size
            ));
        }
        if let Some(seq) = seq {
            if seq.ncols() != batch {
                return Err(format!(
                    "sequence batch {} does not match image batch {}",
                    seq.ncols(),
                    batch
                ));
            }
            if seq.nrows() != self.config.seq_length {
                return Err(format!(
                    "sequence length {} does not match configured seq_length {}",
                    seq.nrows(),
                    self.config.seq_length
                ));
            }
            debug_assert!(
                right_padded(seq),
                "sequence columns must be right-padded: no real token may follow a 0"
            );
        }
        if tags.nrows() != batch {
            return Err(format!(
                "semantic-word batch {} does not match image batch {}",
                tags.nrows(),
                batch
            ));
        }
        if tags.ncols() == 0 {
            return Err("semantic words must contain at least one tag per example".to_string());
        }
        Ok(batch)
    }
}

fn right_padded(seq: &Array2<i64>) -> bool {
    for col in seq.columns() {
        let mut seen_pad = false;
        for &v in col.iter() {
            if v == 0 {
                seen_pad = true;
            } else if seen_pad {
                return false;
            }
        }
    }
    true
}

pub(crate) fn argmax_row(row: &ndarray::ArrayView1<f32>) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (j, &v) in row.iter().enumerate() {
        // Strict comparison: ties resolve to the lowest index.
        if v > best_val {
            best = j;
            best_val = v;
        }
    }
    (best, best_val)
}
