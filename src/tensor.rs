use crate::ops::{
    Add, Concat, Dropout, EmbeddingLookup, LogSoftmax, MatMul, Mean, Mul, Operation, Reshape,
    Sigmoid, Slice, Softmax, Stack, Sub, Sum, SumAxis, Tanh,
};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// `TensorData` contains the actual data of a tensor, along with the
/// metadata reverse-mode differentiation needs.
pub struct TensorData {
    /// The tensor's values, stored as a dynamically-dimensioned f32 array.
    pub data: ArrayD<f32>,
    /// The gradient of the tensor, if one has been accumulated.
    pub grad: Option<ArrayD<f32>>,
    /// The operation that created this tensor, if any.
    pub creator: Option<Arc<dyn Operation + Send + Sync>>,
    /// The input tensors the creator consumed.
    pub inputs: Vec<Tensor>,
    /// Whether this tensor accumulates a gradient.
    pub requires_grad: bool,
}

/// A multi-dimensional f32 array that supports reverse-mode differentiation.
///
/// Applying operations to tensors records a computation graph: each result
/// keeps its creator operation and input handles. A forward pass over the
/// recurrent unroll therefore leaves behind the ordered per-step contexts
/// that [`Tensor::run_backward`] consumes in reverse.
#[derive(Clone)]
pub struct Tensor(Arc<Mutex<TensorData>>);

impl Tensor {
    /// Creates a new leaf tensor.
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: None,
            inputs: vec![],
            requires_grad,
        })))
    }

    /// Creates a tensor filled with zeros.
    pub fn zeros(shape: &[usize], requires_grad: bool) -> Self {
        Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
    }

    /// Applies an operation to a set of input tensors, recording the graph.
    pub fn apply(op: Arc<dyn Operation + Send + Sync>, inputs: &[Tensor]) -> Tensor {
        let requires_grad = inputs.iter().any(|t| t.lock().requires_grad);
        // Element-wise ops rely on the preallocated output carrying the
        // broadcast shape; shape-changing ops overwrite it wholesale.
        let out_shape: Vec<usize> = {
            let shapes: Vec<Vec<usize>> = inputs
                .iter()
                .map(|t| t.lock().data.shape().to_vec())
                .collect();
            match broadcast_shape_from(&shapes) {
                Ok(s) => s,
                Err(_) => inputs[0].lock().data.shape().to_vec(),
            }
        };

        let mut data = ArrayD::zeros(IxDyn(&out_shape));
        op.forward(inputs, &mut data);

        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: Some(op),
            inputs: inputs.to_vec(),
            requires_grad,
        })))
    }

    /// Adds two tensors (broadcasting).
    pub fn add(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Add), &[self.clone(), other.clone()])
    }

    /// Subtracts two tensors (broadcasting).
    pub fn sub(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Sub), &[self.clone(), other.clone()])
    }

    /// Multiplies two tensors element-wise (broadcasting).
    pub fn mul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Mul), &[self.clone(), other.clone()])
    }

    /// Performs 2-D matrix multiplication.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(MatMul), &[self.clone(), other.clone()])
    }

    /// Applies the sigmoid activation function.
    pub fn sigmoid(&self) -> Tensor {
        Tensor::apply(Arc::new(Sigmoid), &[self.clone()])
    }

    /// Applies the tanh activation function.
    pub fn tanh(&self) -> Tensor {
        Tensor::apply(Arc::new(Tanh), &[self.clone()])
    }

    /// Computes the sum of all elements.
    pub fn sum(&self) -> Tensor {
        Tensor::apply(Arc::new(Sum), &[self.clone()])
    }

    /// Sums along one axis, removing it.
    pub fn sum_axis(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(SumAxis::new(axis)), &[self.clone()])
    }

    /// Computes the mean of all elements.
    pub fn mean(&self) -> Tensor {
        Tensor::apply(Arc::new(Mean), &[self.clone()])
    }

    /// Numerically stable softmax along the given axis.
    pub fn softmax(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Softmax::new(axis)), &[self.clone()])
    }

    /// Numerically stable log-softmax along the given axis.
    pub fn log_softmax(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(LogSoftmax::new(axis)), &[self.clone()])
    }

    /// Reshapes the tensor, preserving element order.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor, String> {
        let len: usize = self.lock().data.len();
        let target: usize = shape.iter().product();
        if len != target {
            return Err(format!(
                "Cannot reshape tensor of {} elements to {:?}",
                len, shape
            ));
        }
        Ok(Tensor::apply(Arc::new(Reshape::new(shape)), &[self.clone()]))
    }

    /// Concatenates tensors along an existing axis.
    pub fn concat(tensors: &[Tensor], axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Concat(axis)), tensors)
    }

    /// Stacks tensors along a new axis.
    pub fn stack(tensors: &[Tensor], axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Stack(axis)), tensors)
    }

    /// Slices `len` columns starting at `start` from a 2-D tensor.
    pub fn slice_cols(&self, start: usize, len: usize) -> Tensor {
        Tensor::apply(Arc::new(Slice::new(start, len)), &[self.clone()])
    }

    /// Inverted dropout with keep-probability `1 - p`. A no-op when
    /// `training` is false or `p` is zero.
    pub fn dropout(&self, p: f32, training: bool) -> Tensor {
        Tensor::apply(Arc::new(Dropout::new(p, training)), &[self.clone()])
    }

    /// Gathers rows of `table` by the ids stored (as f32) in `ids`.
    /// Output shape is `ids.shape() ++ [row_width]`.
    pub fn embedding_lookup(table: &Tensor, ids: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(EmbeddingLookup), &[table.clone(), ids.clone()])
    }

    /// Locks the tensor's data for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, TensorData> {
        self.0.lock().unwrap()
    }

    /// Returns an owned copy of the tensor's values.
    pub fn to_array(&self) -> ArrayD<f32> {
        self.lock().data.clone()
    }

    /// Clears any accumulated gradient.
    pub fn zero_grad(&self) {
        self.lock().grad = None;
    }

    /// Returns a graph-detached copy of the values.
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.lock().data.clone(), false)
    }

    /// Whether this tensor accumulates a gradient.
    pub fn requires_grad(&self) -> bool {
        self.lock().requires_grad
    }

    /// Runs reverse-mode accumulation from this tensor, seeding its
    /// gradient with ones if none is set.
    pub fn backward(&self) {
        {
            let mut lock = self.lock();
            if lock.grad.is_none() {
                lock.grad = Some(ArrayD::ones(lock.data.dim()));
            }
        }
        Tensor::run_backward(&[self.clone()]);
    }

    /// Runs reverse-mode accumulation from this tensor with a
    /// caller-supplied output gradient.
    pub fn backward_with_grad(&self, grad: ArrayD<f32>) {
        {
            let mut lock = self.lock();
            assert_eq!(
                lock.data.shape(),
                grad.shape(),
                "backward_with_grad: gradient shape must match tensor shape"
            );
            match &mut lock.grad {
                Some(acc) => *acc += &grad,
                None => lock.grad = Some(grad),
            }
        }
        Tensor::run_backward(&[self.clone()]);
    }

    /// Propagates the already-seeded gradients of `roots` through the
    /// recorded graph in a single reverse topological pass.
    ///
    /// Every node is processed exactly once, after all of its consumers,
    /// so gradients from fan-out (a hidden state feeding both the next
    /// step's cell and its attention query) accumulate before they are
    /// pushed further back.
    pub fn run_backward(roots: &[Tensor]) {
        let mut visited: HashSet<*const Mutex<TensorData>> = HashSet::new();
        let mut topo: Vec<Tensor> = Vec::new();
        for root in roots {
            root.build_topo(&mut visited, &mut topo);
        }

        for node in topo.iter().rev() {
            let (creator, inputs, grad) = {
                let lock = node.lock();
                if !lock.requires_grad {
                    continue;
                }
                (lock.creator.clone(), lock.inputs.clone(), lock.grad.clone())
            };
            let creator = match creator {
                Some(c) => c,
                None => continue,
            };
            let grad = match grad {
                Some(g) => g,
                // No consumer contributed a gradient to this node.
                None => continue,
            };
            let input_grads = creator.backward(&inputs, &grad);
            debug_assert_eq!(input_grads.len(), inputs.len());
            for (input, g) in inputs.iter().zip(input_grads.into_iter()) {
                let mut input_lock = input.lock();
                if !input_lock.requires_grad {
                    continue;
                }
                match &mut input_lock.grad {
                    Some(acc) => *acc += &g,
                    None => input_lock.grad = Some(g),
                }
            }
        }
    }

    /// Builds a topological order of the graph below `self`.
    fn build_topo(
        &self,
        visited: &mut HashSet<*const Mutex<TensorData>>,
        topo_order: &mut Vec<Tensor>,
    ) {
        let ptr = Arc::as_ptr(&self.0);
        if !visited.contains(&ptr) {
            visited.insert(ptr);
            let inputs = self.lock().inputs.clone();
            for input in &inputs {
                input.build_topo(visited, topo_order);
            }
            topo_order.push(self.clone());
        }
    }
}

// Broadcast shape inference for element-wise operations.
fn broadcast_shape_from(shapes: &[Vec<usize>]) -> Result<Vec<usize>, String> {
    let max_ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut result = vec![1usize; max_ndim];
    for s in shapes {
        for (i, &dim) in s.iter().rev().enumerate() {
            let ridx = max_ndim - 1 - i;
            let cur = result[ridx];
            if cur == 1 {
                result[ridx] = dim;
            } else if dim == 1 || cur == dim {
                // compatible
            } else {
                return Err(format!("Cannot broadcast shapes: {:?}", shapes));
            }
        }
    }
    Ok(result)
}

// Identity semantics: two handles are equal when they share storage. The
// optimizers key their per-parameter state on this.
use std::ops::Deref;

impl Deref for Tensor {
    type Target = Arc<Mutex<TensorData>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tensor {}

use std::hash::{Hash, Hasher};

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}
