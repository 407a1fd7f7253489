use crate::tensor::Tensor;
use ndarray::{ArrayD, ArrayView2, Axis, Ix2, IxDyn, SliceInfo, SliceInfoElem};
use rand::Rng;
use std::any::Any;

// Helper: reduce `grad` to `target_shape` by summing over broadcasted axes.
fn reduce_grad_to_shape(grad: &ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.clone();
    }

    let mut res = grad.clone();
    let grad_ndim = res.ndim();
    let target_ndim = target_shape.len();
    // If grad has fewer dims than target, pad with ones on the left.
    if grad_ndim < target_ndim {
        let mut new_shape = vec![1; target_ndim - grad_ndim];
        new_shape.extend_from_slice(res.shape());
        res = res
            .to_shape(IxDyn(&new_shape))
            .expect("Broadcast reshape failed")
            .to_owned();
    }

    let grad_ndim = res.ndim();
    let dim_diff = grad_ndim as isize - target_ndim as isize;
    // Sum over axes where the target dimension is 1 or absent.
    for axis in (0..grad_ndim).rev() {
        let axis_idx = axis as isize;
        let target_dim = if axis_idx - dim_diff >= 0 {
            target_shape[(axis_idx - dim_diff) as usize]
        } else {
            1
        };
        if res.shape()[axis] != target_dim {
            res = res.sum_axis(Axis(axis));
        }
    }

    if res.shape() != target_shape {
        res = res
            .to_shape(IxDyn(target_shape))
            .expect("Final reshape to target shape failed")
            .to_owned();
    }
    res
}

// Helper: permute axes so that `axis` becomes the last axis.
fn permute_to_last(a: &ArrayD<f32>, axis: usize) -> (ArrayD<f32>, Option<Vec<usize>>) {
    let ndim = a.ndim();
    if axis == ndim - 1 {
        return (a.clone(), None);
    }
    let mut perm: Vec<usize> = (0..ndim).collect();
    let axis_val = perm.remove(axis);
    perm.push(axis_val);
    let permuted = a.view().permuted_axes(perm.clone()).to_owned();
    (permuted, Some(perm))
}

fn permute_back(a: ArrayD<f32>, perm: &[usize]) -> ArrayD<f32> {
    let ndim = perm.len();
    let mut inv = vec![0usize; ndim];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    a.view().permuted_axes(inv).to_owned()
}

/// A trait for operations that can be performed on tensors.
pub trait Operation: Send + Sync {
    /// Performs the forward pass of the operation.
    ///
    /// # Arguments
    ///
    /// * `inputs` - The input tensors.
    /// * `output` - A mutable reference to the output tensor's data.
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>);

    /// Performs the backward pass of the operation, returning one gradient
    /// per input (zeros for non-differentiable inputs).
    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>>;

    /// Returns the operation as a `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

/// The addition operation (broadcasting).
pub struct Add;

impl Operation for Add {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let out_shape = output.shape().to_vec();
        let a_lock = inputs[0].lock();
        let b_lock = inputs[1].lock();
        let a = a_lock
            .data
            .broadcast(IxDyn(&out_shape))
            .expect("Add: lhs does not broadcast to output shape");
        let b = b_lock
            .data
            .broadcast(IxDyn(&out_shape))
            .expect("Add: rhs does not broadcast to output shape");
        *output = &a + &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let b_shape = inputs[1].lock().data.shape().to_vec();
        vec![
            reduce_grad_to_shape(output_grad, &a_shape),
            reduce_grad_to_shape(output_grad, &b_shape),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The subtraction operation (broadcasting).
pub struct Sub;

impl Operation for Sub {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let out_shape = output.shape().to_vec();
        let a_lock = inputs[0].lock();
        let b_lock = inputs[1].lock();
        let a = a_lock
            .data
            .broadcast(IxDyn(&out_shape))
            .expect("Sub: lhs does not broadcast to output shape");
        let b = b_lock
            .data
            .broadcast(IxDyn(&out_shape))
            .expect("Sub: rhs does not broadcast to output shape");
        *output = &a - &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let b_shape = inputs[1].lock().data.shape().to_vec();
        vec![
            reduce_grad_to_shape(output_grad, &a_shape),
            reduce_grad_to_shape(&(-output_grad), &b_shape),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The element-wise multiplication operation (broadcasting).
pub struct Mul;

impl Operation for Mul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let out_shape = output.shape().to_vec();
        let a_lock = inputs[0].lock();
        let b_lock = inputs[1].lock();
        let a = a_lock
            .data
            .broadcast(IxDyn(&out_shape))
            .expect("Mul: lhs does not broadcast to output shape");
        let b = b_lock
            .data
            .broadcast(IxDyn(&out_shape))
            .expect("Mul: rhs does not broadcast to output shape");
        *output = &a * &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let out_shape = output_grad.shape().to_vec();
        let (a, a_shape) = {
            let lock = inputs[0].lock();
            (lock.data.clone(), lock.data.shape().to_vec())
        };
        let (b, b_shape) = {
            let lock = inputs[1].lock();
            (lock.data.clone(), lock.data.shape().to_vec())
        };
        let a_b = a
            .broadcast(IxDyn(&out_shape))
            .expect("Mul backward: lhs broadcast failed")
            .to_owned();
        let b_b = b
            .broadcast(IxDyn(&out_shape))
            .expect("Mul backward: rhs broadcast failed")
            .to_owned();
        vec![
            reduce_grad_to_shape(&(&b_b * output_grad), &a_shape),
            reduce_grad_to_shape(&(&a_b * output_grad), &b_shape),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The 2-D matrix multiplication operation.
pub struct MatMul;

impl Operation for MatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a_lock = inputs[0].lock();
        let b_lock = inputs[1].lock();
        let a: ArrayView2<f32> = a_lock
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("MatMul expects 2D left operand");
        let b: ArrayView2<f32> = b_lock
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("MatMul expects 2D right operand");
        assert_eq!(
            a.ncols(),
            b.nrows(),
            "MatMul: inner dimensions do not agree"
        );
        *output = a.dot(&b).into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_lock = inputs[0].lock();
        let b_lock = inputs[1].lock();
        let a: ArrayView2<f32> = a_lock
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("MatMul expects 2D left operand");
        let b: ArrayView2<f32> = b_lock
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("MatMul expects 2D right operand");
        let og: ArrayView2<f32> = output_grad
            .view()
            .into_dimensionality::<Ix2>()
            .expect("MatMul expects 2D output grad");
        let grad_a = og.dot(&b.t()).into_dyn();
        let grad_b = a.t().dot(&og).into_dyn();
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The sigmoid activation.
pub struct Sigmoid;

impl Operation for Sigmoid {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        *output = a.mapv(|x| 1.0 / (1.0 + (-x).exp()));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = &inputs[0].lock().data;
        let s = a.mapv(|x| 1.0 / (1.0 + (-x).exp()));
        vec![output_grad * &s.mapv(|y| y * (1.0 - y))]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The tanh activation.
pub struct Tanh;

impl Operation for Tanh {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        *output = a.mapv(f32::tanh);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = &inputs[0].lock().data;
        let t = a.mapv(f32::tanh);
        vec![output_grad * &t.mapv(|y| 1.0 - y * y)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sum of all elements to a scalar.
pub struct Sum;

impl Operation for Sum {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        *output = ArrayD::from_elem(IxDyn(&[]), a.sum());
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let val = *output_grad
            .iter()
            .next()
            .expect("Sum backward expects a scalar output grad");
        vec![ArrayD::from_elem(IxDyn(&a_shape), val)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mean of all elements to a scalar.
pub struct Mean;

impl Operation for Mean {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        *output = ArrayD::from_elem(IxDyn(&[]), a.sum() / (a.len() as f32));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (shape, len) = {
            let lock = inputs[0].lock();
            (lock.data.shape().to_vec(), lock.data.len())
        };
        let val = *output_grad
            .iter()
            .next()
            .expect("Mean backward expects a scalar output grad");
        vec![ArrayD::from_elem(IxDyn(&shape), val / (len as f32))]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sum along a single axis, removing it.
pub struct SumAxis {
    pub axis: usize,
}

impl SumAxis {
    pub fn new(axis: usize) -> Self {
        SumAxis { axis }
    }
}

impl Operation for SumAxis {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        assert!(self.axis < a.ndim(), "SumAxis: axis out of range");
        *output = a.sum_axis(Axis(self.axis));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].lock().data.shape().to_vec();
        let expanded = output_grad.clone().insert_axis(Axis(self.axis));
        let grad = expanded
            .broadcast(IxDyn(&in_shape))
            .expect("SumAxis backward: broadcast failed")
            .to_owned();
        vec![grad]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reshape: changes the shape but keeps element order.
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: Vec<usize>) -> Self {
        Reshape { shape }
    }
}

impl Operation for Reshape {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].lock().data.clone();
        *output = a
            .to_shape(IxDyn(&self.shape))
            .expect("Reshape forward: invalid shape")
            .to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].lock().data.shape().to_vec();
        vec![output_grad
            .to_shape(IxDyn(&in_shape))
            .expect("Reshape backward: invalid shape")
            .to_owned()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Numerically stable softmax along an axis.
pub struct Softmax {
    pub axis: usize,
}

impl Softmax {
    pub fn new(axis: usize) -> Self {
        Softmax { axis }
    }
}

fn softmax_along_last(x: &mut ArrayD<f32>) {
    let last_axis = x.ndim() - 1;
    for mut lane in x.lanes_mut(Axis(last_axis)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }
}

impl Operation for Softmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = &inputs[0].lock().data;
        let axis = self.axis.min(x.ndim() - 1);
        let (mut out, perm_opt) = permute_to_last(x, axis);
        softmax_along_last(&mut out);
        *output = match perm_opt {
            Some(ref perm) => permute_back(out, perm),
            None => out,
        };
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = &inputs[0].lock().data;
        let axis = self.axis.min(x.ndim() - 1);
        let (mut y, perm_opt) = permute_to_last(x, axis);
        softmax_along_last(&mut y);
        let last_axis = y.ndim() - 1;
        // grad = y * (grad_out - sum(grad_out * y)) per lane
        let (p_output_grad, _) = permute_to_last(output_grad, axis);
        let mut grad_in = p_output_grad.clone();
        for (mut g_lane, y_lane) in grad_in
            .lanes_mut(Axis(last_axis))
            .into_iter()
            .zip(y.lanes(Axis(last_axis)).into_iter())
        {
            let mut s = 0.0f32;
            for (g, &yy) in g_lane.iter().zip(y_lane.iter()) {
                s += g * yy;
            }
            for (g, &yy) in g_lane.iter_mut().zip(y_lane.iter()) {
                *g = yy * (*g - s);
            }
        }
        match perm_opt {
            Some(ref perm) => vec![permute_back(grad_in, perm)],
            None => vec![grad_in],
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Numerically stable log-softmax along an axis: `x - logsumexp(x)`.
pub struct LogSoftmax {
    pub axis: usize,
}

impl LogSoftmax {
    pub fn new(axis: usize) -> Self {
        LogSoftmax { axis }
    }
}

impl Operation for LogSoftmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = &inputs[0].lock().data;
        let axis = self.axis.min(x.ndim() - 1);
        let (mut out, perm_opt) = permute_to_last(x, axis);
        let last_axis = out.ndim() - 1;
        for mut lane in out.lanes_mut(Axis(last_axis)) {
            let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for v in lane.iter() {
                sum += (*v - max).exp();
            }
            let logsum = sum.ln();
            for v in lane.iter_mut() {
                *v = (*v - max) - logsum;
            }
        }
        *output = match perm_opt {
            Some(ref perm) => permute_back(out, perm),
            None => out,
        };
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = &inputs[0].lock().data;
        let axis = self.axis.min(x.ndim() - 1);
        let (mut y, perm_opt) = permute_to_last(x, axis);
        softmax_along_last(&mut y);
        let last_axis = y.ndim() - 1;
        // grad_input = grad_output - softmax * sum(grad_output) per lane
        let (p_output_grad, _) = permute_to_last(output_grad, axis);
        let mut grad_in = p_output_grad.clone();
        for (mut g_lane, y_lane) in grad_in
            .lanes_mut(Axis(last_axis))
            .into_iter()
            .zip(y.lanes(Axis(last_axis)).into_iter())
        {
            let mut s = 0.0f32;
            for g in g_lane.iter() {
                s += *g;
            }
            for (g, &yy) in g_lane.iter_mut().zip(y_lane.iter()) {
                *g -= yy * s;
            }
        }
        match perm_opt {
            Some(ref perm) => vec![permute_back(grad_in, perm)],
            None => vec![grad_in],
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Concatenation along an existing axis.
pub struct Concat(pub usize);

impl Operation for Concat {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let axis = self.0;
        let arrays: Vec<ArrayD<f32>> = inputs.iter().map(|t| t.lock().data.clone()).collect();
        *output = ndarray::concatenate(
            Axis(axis),
            &arrays.iter().map(|x| x.view()).collect::<Vec<_>>(),
        )
        .expect("Concat: incompatible input shapes");
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let axis = self.0;
        let mut grads = Vec::new();
        let mut current_index = 0;
        for input in inputs {
            let input_shape = input.lock().data.shape().to_vec();
            let mut slice_info_elems: Vec<SliceInfoElem> = Vec::new();
            for i in 0..input_shape.len() {
                if i == axis {
                    slice_info_elems
                        .push((current_index..current_index + input_shape[axis]).into());
                } else {
                    slice_info_elems.push((..).into());
                }
            }
            let slice_info: SliceInfo<_, IxDyn, IxDyn> =
                unsafe { SliceInfo::new(slice_info_elems).unwrap() };
            grads.push(output_grad.slice(slice_info).to_owned().into_dyn());
            current_index += input_shape[axis];
        }
        grads
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Stacking along a new axis.
pub struct Stack(pub usize);

impl Operation for Stack {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let axis = self.0;
        let arrays: Vec<ArrayD<f32>> = inputs.iter().map(|t| t.lock().data.clone()).collect();
        *output = ndarray::stack(
            Axis(axis),
            &arrays.iter().map(|x| x.view()).collect::<Vec<_>>(),
        )
        .expect("Stack: incompatible input shapes");
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let axis = self.0;
        let mut grads = Vec::new();
        for (i, _input) in inputs.iter().enumerate() {
            let mut slice_info_elems: Vec<SliceInfoElem> = Vec::new();
            for j in 0..output_grad.ndim() {
                if j == axis {
                    slice_info_elems.push((i..i + 1).into());
                } else {
                    slice_info_elems.push((..).into());
                }
            }
            let slice_info: SliceInfo<_, IxDyn, IxDyn> =
                unsafe { SliceInfo::new(slice_info_elems).unwrap() };
            grads.push(
                output_grad
                    .slice(slice_info)
                    .to_owned()
                    .into_dyn()
                    .remove_axis(Axis(axis)),
            );
        }
        grads
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Column slice of a 2-D tensor: `len` columns starting at `start`.
/// Used to split the recurrent cell's fused gate activations.
pub struct Slice {
    pub start: usize,
    pub len: usize,
}

impl Slice {
    pub fn new(start: usize, len: usize) -> Self {
        Slice { start, len }
    }
}

impl Operation for Slice {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = &inputs[0].lock().data;
        let a2 = a
            .view()
            .into_dimensionality::<Ix2>()
            .expect("Slice: expected 2D input");
        *output = a2
            .slice(ndarray::s![.., self.start..self.start + self.len])
            .to_owned()
            .into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].lock().data.shape().to_vec();
        let mut res = ndarray::Array2::<f32>::zeros((a_shape[0], a_shape[1]));
        let og2 = output_grad
            .view()
            .into_dimensionality::<Ix2>()
            .expect("Slice: expected 2D output grad");
        res.slice_mut(ndarray::s![.., self.start..self.start + self.len])
            .assign(&og2);
        vec![res.into_dyn()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inverted dropout. The sampled mask is cached for the backward pass.
pub struct Dropout {
    pub p: f32,
    pub training: bool,
    mask: std::sync::Mutex<Option<ArrayD<f32>>>,
}

impl Dropout {
    pub fn new(p: f32, training: bool) -> Self {
        Dropout {
            p,
            training,
            mask: std::sync::Mutex::new(None),
        }
    }
}

impl Operation for Dropout {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = &inputs[0].lock().data;
        if !self.training || self.p <= 0.0 {
            *output = x.clone();
            return;
        }
        let keep = 1.0 - self.p;
        let mut rng = rand::thread_rng();
        let mut mask = ArrayD::<f32>::zeros(x.dim());
        for m in mask.iter_mut() {
            let r: f32 = rng.gen();
            *m = if r < keep { 1.0 / keep } else { 0.0 };
        }
        *output = x * &mask;
        *self.mask.lock().unwrap() = Some(mask);
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        if !self.training || self.p <= 0.0 {
            return vec![output_grad.clone()];
        }
        let mask = self.mask.lock().unwrap();
        match &*mask {
            Some(m) => vec![output_grad * m],
            None => {
                log::warn!("Dropout backward called before forward; returning zeros");
                vec![ArrayD::zeros(output_grad.dim())]
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Row gather from an embedding table.
///
/// `inputs[0]` is the table (rows x width); `inputs[1]` holds the row ids
/// as f32 values in any shape. The output has shape `ids.shape ++ [width]`.
/// Backward scatter-adds into the table; the ids are non-differentiable.
pub struct EmbeddingLookup;

impl Operation for EmbeddingLookup {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let table_lock = inputs[0].lock();
        let ids_lock = inputs[1].lock();
        let table = table_lock
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("EmbeddingLookup: table must be 2D");
        let rows = table.nrows();
        let width = table.ncols();
        let ids = &ids_lock.data;

        let mut out_shape = ids.shape().to_vec();
        out_shape.push(width);
        let mut out = ArrayD::<f32>::zeros(IxDyn(&out_shape));
        {
            let flat_len = ids.len();
            let mut out2 = out
                .view_mut()
                .into_shape_with_order((flat_len, width))
                .expect("EmbeddingLookup: output reshape failed");
            for (i, id) in ids.iter().enumerate() {
                let idx = *id as usize;
                assert!(
                    idx < rows,
                    "EmbeddingLookup: id {} out of range for {} rows",
                    idx,
                    rows
                );
                out2.row_mut(i).assign(&table.row(idx));
            }
        }
        *output = out;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let table_shape = inputs[0].lock().data.shape().to_vec();
        let ids = inputs[1].lock().data.clone();
        let width = table_shape[1];
        let mut grad_table = ndarray::Array2::<f32>::zeros((table_shape[0], width));
        let flat_len = ids.len();
        let og = output_grad
            .to_shape((flat_len, width))
            .expect("EmbeddingLookup backward: grad reshape failed");
        for (i, id) in ids.iter().enumerate() {
            let idx = *id as usize;
            let mut row = grad_table.row_mut(idx);
            row += &og.row(i);
        }
        vec![grad_table.into_dyn(), ArrayD::zeros(ids.dim())]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
