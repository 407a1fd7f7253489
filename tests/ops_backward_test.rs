use caption_engine::ops::{EmbeddingLookup, LogSoftmax, Operation, Softmax};
use caption_engine::Tensor;
use ndarray::{array, ArrayD, Axis, IxDyn};

#[test]
fn softmax_backward_sums_to_zero_for_uniform_upstream() {
    let x = array![
        [0.1f32, 0.2, -0.3, 0.0, 0.5, -0.1],
        [0.0, 0.1, 0.2, 0.3, 0.4, 0.5],
        [0.5, 0.4, 0.3, 0.2, 0.1, 0.0],
        [-0.1, 0.0, 0.1, 0.2, 0.3, 0.4]
    ]
    .into_dyn();
    let t = Tensor::new(x, true);
    let soft = Softmax::new(1);
    let mut out = ArrayD::zeros(IxDyn(&[4, 6]));
    soft.forward(&[t.clone()], &mut out);
    for row in out.lanes(Axis(1)) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    let out_grad = ArrayD::from_elem(IxDyn(&[4, 6]), 1.0f32);
    let grads = soft.backward(&[t], &out_grad);
    for v in grads[0].iter() {
        assert!(v.abs() < 1e-6, "non-zero grad: {}", v);
    }
}

#[test]
fn log_softmax_outputs_normalize_and_backward_rows_sum_to_zero() {
    let x = array![[1.0f32, -2.0, 0.5, 3.0], [0.0, 0.0, 0.0, 0.0]].into_dyn();
    let t = Tensor::new(x, true);
    let op = LogSoftmax::new(1);
    let mut out = ArrayD::zeros(IxDyn(&[2, 4]));
    op.forward(&[t.clone()], &mut out);
    for row in out.lanes(Axis(1)) {
        let sum: f32 = row.iter().map(|v| v.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-5, "exp-sum {}", sum);
        for v in row.iter() {
            assert!(*v < 0.0);
        }
    }

    let mut out_grad = ArrayD::zeros(IxDyn(&[2, 4]));
    out_grad[[0, 2]] = 1.0;
    out_grad[[1, 0]] = -0.5;
    let grads = op.backward(&[t], &out_grad);
    for row in grads[0].lanes(Axis(1)) {
        let sum: f32 = row.iter().sum();
        assert!(sum.abs() < 1e-6, "log-softmax grad row sums to {}", sum);
    }
}

#[test]
fn embedding_lookup_gathers_rows_and_scatter_adds_gradients() {
    let table = Tensor::new(
        array![[0.0f32, 0.0], [1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn(),
        true,
    );
    let ids = Tensor::new(array![2.0f32, 1.0, 2.0].into_dyn(), false);

    let out = Tensor::embedding_lookup(&table, &ids);
    let data = out.to_array();
    assert_eq!(data.shape(), &[3, 2]);
    assert_eq!(data[[0, 0]], 3.0);
    assert_eq!(data[[1, 1]], 2.0);

    let op = EmbeddingLookup;
    let out_grad = ArrayD::from_elem(IxDyn(&[3, 2]), 1.0f32);
    let grads = op.backward(&[table, ids], &out_grad);
    // Row 2 was hit twice, row 1 once, rows 0 and 3 never.
    assert_eq!(grads[0][[2, 0]], 2.0);
    assert_eq!(grads[0][[1, 0]], 1.0);
    assert_eq!(grads[0][[0, 0]], 0.0);
    assert_eq!(grads[0][[3, 1]], 0.0);
    // Ids are not differentiable.
    assert_eq!(grads[1].len(), 3);
    assert!(grads[1].iter().all(|v| *v == 0.0));
}

#[test]
fn fan_out_gradients_accumulate_once_per_consumer() {
    // x feeds two separate paths; the topological walk must push x's
    // combined gradient exactly once.
    let x = Tensor::new(array![[1.0f32, 2.0]].into_dyn(), true);
    let a = Tensor::new(array![[3.0f32, 5.0]].into_dyn(), false);
    let b = Tensor::new(array![[-1.0f32, 0.5]].into_dyn(), false);

    let p = x.mul(&a);
    let q = x.mul(&b);
    let total = p.add(&q).sum();
    total.backward();

    let grad = x.lock().grad.clone().expect("x gradient");
    // d/dx (x*a + x*b) = a + b
    assert!((grad[[0, 0]] - 2.0).abs() < 1e-6);
    assert!((grad[[0, 1]] - 5.5).abs() < 1e-6);
}

#[test]
fn backward_with_supplied_gradient_scales_leaf_gradients() {
    let x = Tensor::new(array![[2.0f32, -1.0]].into_dyn(), true);
    let y = x.tanh();
    let seed = ArrayD::from_elem(IxDyn(&[1, 2]), 2.0f32);
    y.backward_with_grad(seed);

    let grad = x.lock().grad.clone().expect("x gradient");
    let expected = |v: f32| 2.0 * (1.0 - v.tanh() * v.tanh());
    assert!((grad[[0, 0]] - expected(2.0)).abs() < 1e-5);
    assert!((grad[[0, 1]] - expected(-1.0)).abs() < 1e-5);
}
