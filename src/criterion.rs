use ndarray::{Array2, ArrayD, IxDyn};

/// A loss over the model's two outputs and the target sequence.
///
/// Components return the scalar loss and a gradient per output; a
/// component that does not consume an output returns zeros for it, so
/// composition is a plain weighted sum per output.
pub trait Criterion {
    fn forward(
        &self,
        log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<f32, String>;

    fn gradient(
        &self,
        log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String>;
}

/// Masked negative log-likelihood over a right-padded target sequence.
///
/// For each batch column the real tokens are supervised in order; the
/// step after the last real token must predict the end marker; every
/// later step contributes zero loss and exactly zero gradient. The loss
/// is the mean over counted positions, so its scale does not depend on
/// batch size or padding amount.
pub struct SequenceCrossEntropy;

impl SequenceCrossEntropy {
    pub fn new() -> Self {
        SequenceCrossEntropy
    }

    /// Scalar loss for `log_probs` (seq_length+1, batch, vocab_size+1)
    /// against `targets` (seq_length, batch).
    pub fn loss(&self, log_probs: &ArrayD<f32>, targets: &Array2<i64>) -> Result<f32, String> {
        let positions = supervised_positions(log_probs, targets)?;
        let count = positions.len() as f32;
        let mut total = 0.0f32;
        for (t, b, class) in positions {
            total -= log_probs[[t, b, class]];
        }
        Ok(total / count)
    }

    /// Gradient of [`Self::loss`] with respect to the log-probabilities,
    /// shape-matched to them: -1/count at each counted position, zero
    /// everywhere else (in particular at every step past a column's end).
    pub fn loss_gradient(
        &self,
        log_probs: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<ArrayD<f32>, String> {
        let positions = supervised_positions(log_probs, targets)?;
        let count = positions.len() as f32;
        let mut grad = ArrayD::<f32>::zeros(log_probs.dim());
        for (t, b, class) in positions {
            grad[[t, b, class]] = -1.0 / count;
        }
        Ok(grad)
    }
}

impl Default for SequenceCrossEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl Criterion for SequenceCrossEntropy {
    fn forward(
        &self,
        log_probs: &ArrayD<f32>,
        _attention: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<f32, String> {
        self.loss(log_probs, targets)
    }

    fn gradient(
        &self,
        log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        Ok((
            self.loss_gradient(log_probs, targets)?,
            ArrayD::zeros(attention.dim()),
        ))
    }
}

// Enumerates (step, column, class) indices that carry loss: one entry per
// real token plus the end marker at the first padding row (or at row
// seq_length for a full column).
fn supervised_positions(
    log_probs: &ArrayD<f32>,
    targets: &Array2<i64>,
) -> Result<Vec<(usize, usize, usize)>, String> {
    if log_probs.ndim() != 3 {
        return Err(format!(
            "log_probs must be 3-dimensional, got {} dims",
            log_probs.ndim()
        ));
    }
    let shape = log_probs.shape();
    let (steps, batch, classes) = (shape[0], shape[1], shape[2]);
    if targets.nrows() + 1 != steps {
        return Err(format!(
            "log_probs carry {} steps but targets have {} rows; expected seq_length+1 steps",
            steps,
            targets.nrows()
        ));
    }
    if targets.ncols() != batch {
        return Err(format!(
            "log_probs batch {} does not match targets batch {}",
            batch,
            targets.ncols()
        ));
    }
    let end_class = classes - 1;
    let seq_length = targets.nrows();

    let mut positions = Vec::new();
    for b in 0..batch {
        let mut ended_at = seq_length;
        for t in 0..seq_length {
            let token = targets[[t, b]];
            if token == 0 {
                ended_at = t;
                break;
            }
            if token < 0 || token as usize > classes {
                return Err(format!(
                    "target token {} at ({}, {}) outside [0, {}]",
                    token, t, b, classes
                ));
            }
            positions.push((t, b, token as usize - 1));
        }
        // The step after the last real token predicts the end marker.
        positions.push((ended_at, b, end_class));
    }
    Ok(positions)
}

/// Coverage regularization over the attention trace.
///
/// Encourages the total attention mass each tag receives across the
/// decoded steps to stay near uniform coverage, penalizing the squared
/// deviation. The image step (trace row 0) carries a constant uniform
/// row and is excluded.
pub struct AttentionCoverage;

impl AttentionCoverage {
    pub fn new() -> Self {
        AttentionCoverage
    }

    /// Scalar penalty for a trace shaped (seq_length+1, batch, K).
    pub fn penalty(&self, attention: &ArrayD<f32>) -> Result<f32, String> {
        let (mass, target, norm) = coverage_mass(attention)?;
        let mut total = 0.0f32;
        for &m in mass.iter() {
            let d = m - target;
            total += d * d;
        }
        Ok(total / norm)
    }

    /// Gradient of [`Self::penalty`], shape-matched to the trace; zero on
    /// the constant image-step row.
    pub fn penalty_gradient(&self, attention: &ArrayD<f32>) -> Result<ArrayD<f32>, String> {
        let (mass, target, norm) = coverage_mass(attention)?;
        let shape = attention.shape().to_vec();
        let mut grad = ArrayD::<f32>::zeros(IxDyn(&shape));
        for t in 1..shape[0] {
            for b in 0..shape[1] {
                for k in 0..shape[2] {
                    grad[[t, b, k]] = 2.0 * (mass[[b, k]] - target) / norm;
                }
            }
        }
        Ok(grad)
    }
}

impl Default for AttentionCoverage {
    fn default() -> Self {
        Self::new()
    }
}

fn coverage_mass(attention: &ArrayD<f32>) -> Result<(Array2<f32>, f32, f32), String> {
    if attention.ndim() != 3 {
        return Err(format!(
            "attention trace must be 3-dimensional, got {} dims",
            attention.ndim()
        ));
    }
    let shape = attention.shape();
    let (steps, batch, k) = (shape[0], shape[1], shape[2]);
    if steps < 2 {
        return Err("attention trace must cover at least one decoded step".to_string());
    }
    // Mass per (batch, tag) over the attention-bearing rows 1..steps.
    let mut mass = Array2::<f32>::zeros((batch, k));
    for t in 1..steps {
        for b in 0..batch {
            for tag in 0..k {
                mass[[b, tag]] += attention[[t, b, tag]];
            }
        }
    }
    let target = (steps - 1) as f32 / k as f32;
    let norm = (batch * k) as f32;
    Ok((mass, target, norm))
}

impl Criterion for AttentionCoverage {
    fn forward(
        &self,
        _log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        _targets: &Array2<i64>,
    ) -> Result<f32, String> {
        self.penalty(attention)
    }

    fn gradient(
        &self,
        log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        _targets: &Array2<i64>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        Ok((
            ArrayD::zeros(log_probs.dim()),
            self.penalty_gradient(attention)?,
        ))
    }
}

/// Weighted combination of criteria that consume the same outputs.
///
/// Total loss is the weighted sum of component losses; the gradient for
/// each output is the weighted sum of the component gradients for that
/// output, computed independently and summed (not averaged).
pub struct CriterionList {
    components: Vec<(Box<dyn Criterion>, f32)>,
}

impl CriterionList {
    pub fn new() -> Self {
        CriterionList {
            components: Vec::new(),
        }
    }

    pub fn add(mut self, criterion: Box<dyn Criterion>, weight: f32) -> Self {
        self.components.push((criterion, weight));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl Default for CriterionList {
    fn default() -> Self {
        Self::new()
    }
}

impl Criterion for CriterionList {
    fn forward(
        &self,
        log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<f32, String> {
        let mut total = 0.0f32;
        for (criterion, weight) in &self.components {
            total += weight * criterion.forward(log_probs, attention, targets)?;
        }
        Ok(total)
    }

    fn gradient(
        &self,
        log_probs: &ArrayD<f32>,
        attention: &ArrayD<f32>,
        targets: &Array2<i64>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        let mut grad_lp = ArrayD::<f32>::zeros(log_probs.dim());
        let mut grad_at = ArrayD::<f32>::zeros(attention.dim());
        for (criterion, weight) in &self.components {
            let (g_lp, g_at) = criterion.gradient(log_probs, attention, targets)?;
            grad_lp += &(g_lp * *weight);
            grad_at += &(g_at * *weight);
        }
        Ok((grad_lp, grad_at))
    }
}
