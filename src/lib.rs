//! This crate provides a recurrent caption language model with attention
//! over semantic-word tags.
//!
//! The model decodes a word sequence conditioned on an externally computed
//! image encoding and a small set of semantic-tag ids. Training runs through
//! an explicit forward/backward contract: `forward` records a per-step
//! computation graph over the unroll, and `backward` consumes
//! caller-supplied gradients for the two outputs (log-probabilities and the
//! attention trace), accumulating parameter gradients and returning the
//! gradient with respect to the image encoding. Decoding is greedy or
//! beam search.

pub mod beam;
pub mod criterion;
pub mod model;
#[path = "nn/mod.rs"]
pub mod nn;
pub mod ops;
pub mod tensor;

pub use beam::BeamSearch;
pub use criterion::{AttentionCoverage, Criterion, CriterionList, SequenceCrossEntropy};
pub use model::{LanguageModel, ModelConfig, ModelGradients, SampleOptions};
pub use tensor::Tensor;
