use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

pub mod attention;
pub use attention::TagAttention;

/// A trait for neural network modules.
pub trait Module {
    /// Performs a forward pass through the module.
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Returns the parameters of the module.
    fn parameters(&self) -> Vec<Tensor>;

    /// Returns (name, tensor) pairs for the module's parameters.
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("{}.param{}", prefix, i), p))
            .collect()
    }
}

/// Creates a parameter tensor with N(0, std) entries.
pub fn normal_param<R: Rng>(shape: &[usize], std: f32, rng: &mut R) -> Tensor {
    let normal = Normal::new(0.0f32, std).expect("invalid normal distribution");
    let data = ArrayD::from_shape_fn(IxDyn(shape), |_| normal.sample(rng));
    Tensor::new(data, true)
}

// Scaled initialization for a layer with the given fan-in.
fn fan_in_std(fan_in: usize) -> f32 {
    (2.0 / (fan_in as f32).max(1.0)).sqrt()
}

/// Token embedding table.
///
/// The table carries `vocab_size + 2` rows: row 0 is the placeholder
/// embedding fed for padding positions, rows 1..=vocab_size are the real
/// words and row vocab_size+1 is the sequence-end marker.
pub struct Embedding {
    pub weight: Tensor,
}

impl Embedding {
    pub fn new<R: Rng>(vocab_size: usize, encoding_size: usize, rng: &mut R) -> Self {
        let weight = normal_param(&[vocab_size + 2, encoding_size], 0.08, rng);
        Embedding { weight }
    }

    /// Looks up the rows for `ids` (f32-encoded token ids, any shape).
    pub fn lookup(&self, ids: &Tensor) -> Tensor {
        Tensor::embedding_lookup(&self.weight, ids)
    }
}

impl Module for Embedding {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.lookup(input)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![(format!("{}.weight", prefix), self.weight.clone())]
    }
}

/// A linear (fully connected) layer.
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Creates a new linear layer.
    ///
    /// # Arguments
    ///
    /// * `in_features` - The number of input features.
    /// * `out_features` - The number of output features.
    /// * `bias` - Whether to include a bias term.
    pub fn new<R: Rng>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let weight = normal_param(&[in_features, out_features], fan_in_std(in_features), rng);
        let bias = if bias {
            Some(Tensor::zeros(&[out_features], true))
        } else {
            None
        };
        Linear { weight, bias }
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let input_shape = input.lock().data.shape().to_vec();
        let ndim = input_shape.len();
        let output = if ndim == 2 {
            input.matmul(&self.weight)
        } else {
            // Collapse leading dims to 2D [batch, features].
            let last = input_shape[ndim - 1];
            let batch = input_shape[..ndim - 1].iter().product::<usize>();
            let reshaped = input.reshape(vec![batch, last]).unwrap();
            let out2 = reshaped.matmul(&self.weight);
            let mut out_shape = input_shape.clone();
            out_shape[ndim - 1] = self.weight.lock().data.shape()[1];
            out2.reshape(out_shape).unwrap()
        };
        if let Some(bias) = &self.bias {
            output.add(bias)
        } else {
            output
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = vec![(format!("{}.weight", prefix), self.weight.clone())];
        if let Some(b) = &self.bias {
            out.push((format!("{}.bias", prefix), b.clone()));
        }
        out
    }
}

/// A gated recurrent (LSTM) cell.
pub struct LstmCell {
    /// Input-to-gates weights, shape [input_dim, 4*hidden_dim].
    pub weight_ih: Tensor,
    /// Hidden-to-gates weights, shape [hidden_dim, 4*hidden_dim].
    pub weight_hh: Tensor,
    pub bias: Tensor,
    pub hidden_dim: usize,
}

impl LstmCell {
    pub fn new<R: Rng>(input_dim: usize, hidden_dim: usize, rng: &mut R) -> Self {
        LstmCell {
            weight_ih: normal_param(&[input_dim, 4 * hidden_dim], fan_in_std(input_dim), rng),
            weight_hh: normal_param(&[hidden_dim, 4 * hidden_dim], fan_in_std(hidden_dim), rng),
            bias: Tensor::zeros(&[4 * hidden_dim], true),
            hidden_dim,
        }
    }

    /// Advances one step. `input` is [batch, input_dim]; `h` and `c` are
    /// [batch, hidden_dim]. Returns the new (h, c).
    pub fn forward_step(&self, input: &Tensor, h: &Tensor, c: &Tensor) -> (Tensor, Tensor) {
        // gates = input @ w_ih + h @ w_hh + bias, shape [batch, 4*hidden]
        let xw = input.matmul(&self.weight_ih);
        let hw = h.matmul(&self.weight_hh);
        let gates = xw.add(&hw).add(&self.bias);
        let hid = self.hidden_dim;
        let i = gates.slice_cols(0, hid).sigmoid();
        let f = gates.slice_cols(hid, hid).sigmoid();
        let g = gates.slice_cols(2 * hid, hid).tanh();
        let o = gates.slice_cols(3 * hid, hid).sigmoid();
        let new_c = f.mul(c).add(&i.mul(&g));
        let new_h = o.mul(&new_c.tanh());
        (new_h, new_c)
    }
}

impl Module for LstmCell {
    // Step-wise use goes through `forward_step`.
    fn forward(&self, input: &Tensor) -> Tensor {
        input.clone()
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![
            self.weight_ih.clone(),
            self.weight_hh.clone(),
            self.bias.clone(),
        ]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![
            (format!("{}.weight_ih", prefix), self.weight_ih.clone()),
            (format!("{}.weight_hh", prefix), self.weight_hh.clone()),
            (format!("{}.bias", prefix), self.bias.clone()),
        ]
    }
}

/// A trait for optimizers.
pub trait Optimizer {
    /// Performs a single optimization step.
    fn step(&mut self, parameters: &[Tensor]);

    /// Sets the gradients of all parameters to None.
    fn zero_grad(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            param.lock().grad = None;
        }
    }

    /// Clips gradients in-place using the global norm.
    fn clip_gradients(&mut self, parameters: &[Tensor], max_norm: f32) {
        if max_norm <= 0.0 {
            return;
        }
        let mut total_sq = 0.0f32;
        for p in parameters {
            let lock = p.lock();
            if let Some(g) = &lock.grad {
                for v in g.iter() {
                    total_sq += v * v;
                }
            }
        }
        let total_norm = total_sq.sqrt();
        if total_norm <= max_norm {
            return;
        }
        let scale = max_norm / (total_norm + 1e-12);
        for p in parameters {
            let mut lock = p.lock();
            if let Some(g) = &mut lock.grad {
                g.mapv_inplace(|v| v * scale);
            }
        }
    }
}

/// Stochastic gradient descent with momentum.
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: HashMap<Tensor, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Sgd {
            lr,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            let mut param_lock = param.lock();
            if let Some(grad) = param_lock.grad.clone() {
                let velocity = self
                    .velocity
                    .entry(param.clone())
                    .or_insert_with(|| ArrayD::zeros(grad.dim()));
                *velocity = &*velocity * self.momentum + &grad * (1.0 - self.momentum);
                let update = velocity.mapv(|v| v * self.lr);
                param_lock.data = &param_lock.data - &update;
            }
        }
    }
}

/// Adam optimizer (per-parameter adaptive learning rates).
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: usize,
    m: HashMap<Tensor, ArrayD<f32>>,
    v: HashMap<Tensor, ArrayD<f32>>,
}

impl Adam {
    /// Creates a new Adam optimizer.
    ///
    /// # Arguments
    ///
    /// * `lr` - The learning rate.
    /// * `beta1` - The exponential decay rate for the first moment estimates.
    /// * `beta2` - The exponential decay rate for the second moment estimates.
    /// * `eps` - A small constant for numerical stability.
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &[Tensor]) {
        self.t += 1;

        for param in parameters {
            let mut param_lock = param.lock();
            if let Some(grad) = param_lock.grad.clone() {
                let m = self
                    .m
                    .entry(param.clone())
                    .or_insert_with(|| ArrayD::zeros(grad.dim()));
                let v = self
                    .v
                    .entry(param.clone())
                    .or_insert_with(|| ArrayD::zeros(grad.dim()));

                *m = &*m * self.beta1 + &grad * (1.0 - self.beta1);
                *v = &*v * self.beta2 + &(&grad * &grad) * (1.0 - self.beta2);

                let m_hat = &*m / (1.0 - self.beta1.powi(self.t as i32));
                let v_hat = &*v / (1.0 - self.beta2.powi(self.t as i32));

                let update = (m_hat / (v_hat.mapv(|x| x.sqrt()) + self.eps)) * self.lr;
                param_lock.data = &param_lock.data - &update;
            }
        }
    }
}

/// RMSProp optimizer.
pub struct RmsProp {
    lr: f32,
    alpha: f32,
    eps: f32,
    state: HashMap<Tensor, ArrayD<f32>>,
}

impl RmsProp {
    pub fn new(lr: f32, alpha: f32, eps: f32) -> Self {
        RmsProp {
            lr,
            alpha,
            eps,
            state: HashMap::new(),
        }
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            let mut param_lock = param.lock();
            if let Some(grad) = param_lock.grad.clone() {
                let sq = self
                    .state
                    .entry(param.clone())
                    .or_insert_with(|| ArrayD::zeros(grad.dim()));
                *sq = &*sq * self.alpha + &(&grad * &grad) * (1.0 - self.alpha);
                let update = &grad / &(sq.mapv(|x| x.sqrt()) + self.eps) * self.lr;
                param_lock.data = &param_lock.data - &update;
            }
        }
    }
}
