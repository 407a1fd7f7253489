use crate::nn::{Linear, Module};
use crate::tensor::Tensor;
use rand::Rng;

/// Additive attention over semantic-tag embeddings.
///
/// At each decoding step the previous top-layer hidden state queries the
/// tag bank: `e_k = v^T tanh(W_q h + W_k tag_k)`, the scores are
/// softmax-normalized over the K tags, and the context is the
/// weight-averaged tag embedding. Returns both the context vector
/// [batch, encoding_size] and the weight distribution [batch, K].
pub struct TagAttention {
    w_query: Linear,
    w_key: Linear,
    score: Linear,
}

impl TagAttention {
    /// `rnn_size` is the query width, `encoding_size` the tag-embedding
    /// width; the additive energy space has `rnn_size` units.
    pub fn new<R: Rng>(rnn_size: usize, encoding_size: usize, rng: &mut R) -> Self {
        TagAttention {
            w_query: Linear::new(rnn_size, rnn_size, false, rng),
            w_key: Linear::new(encoding_size, rnn_size, false, rng),
            score: Linear::new(rnn_size, 1, false, rng),
        }
    }

    /// `query`: [batch, rnn_size]; `tags`: [batch, K, encoding_size].
    /// Returns (context [batch, encoding_size], weights [batch, K]).
    pub fn forward(&self, query: &Tensor, tags: &Tensor) -> (Tensor, Tensor) {
        let tag_shape = tags.lock().data.shape().to_vec();
        let (b, k, e) = (tag_shape[0], tag_shape[1], tag_shape[2]);
        let a = self.w_query.weight.lock().data.shape()[1];

        // Project keys and query into the shared energy space.
        let keys = tags.reshape(vec![b * k, e]).unwrap();
        let k_proj = self.w_key.forward(&keys).reshape(vec![b, k, a]).unwrap();
        let q_proj = self.w_query.forward(query).reshape(vec![b, 1, a]).unwrap();

        // e = v^T tanh(Wq q + Wk k_i) -> [b, k]
        let energy = k_proj.add(&q_proj).tanh();
        let scores = self
            .score
            .forward(&energy.reshape(vec![b * k, a]).unwrap())
            .reshape(vec![b, k])
            .unwrap();

        let weights = scores.softmax(1);

        // context = sum_k alpha_k * tag_k -> [b, e]
        let expanded = weights.reshape(vec![b, k, 1]).unwrap();
        let context = tags.mul(&expanded).sum_axis(1);

        (context, weights)
    }
}

impl Module for TagAttention {
    fn forward(&self, input: &Tensor) -> Tensor {
        // Step-wise use goes through the two-argument `forward`.
        input.clone()
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.w_query.parameters();
        p.extend(self.w_key.parameters());
        p.extend(self.score.parameters());
        p
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = self
            .w_query
            .named_parameters(&format!("{}.w_query", prefix));
        out.extend(self.w_key.named_parameters(&format!("{}.w_key", prefix)));
        out.extend(self.score.named_parameters(&format!("{}.score", prefix)));
        out
    }
}
