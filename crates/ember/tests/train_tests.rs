// End-to-end training on the CPU backend: the whole stack wired
// together — session graph, staged arguments, reverse-order backward,
// asynchronous optimizer steps joined by the next iteration's reads.

use ember::prelude::*;
use ember::{Flatten, Module};

#[test]
fn mlp_loss_descends_on_xor() {
    let session = Session::with_workers(2);
    let backend = ComputeBackend::Cpu;

    let mut model = Sequential::new(&session, &backend)
        .push(Linear::new(&session, &backend, 2, 8, true).unwrap())
        .push(Activation::tanh(&session, &backend))
        .push(Linear::new(&session, &backend, 8, 1, true).unwrap());
    let mut loss = MseLoss::new(&session, &backend, Reduction::Mean);
    let mut opt = Sgd::new(
        &session,
        &backend,
        model.parameters(),
        0.2,
        0.9,
        0.0,
        0.0,
        false,
    )
    .unwrap();

    let x = Tensor::from_vec(vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], (4, 2)).unwrap();
    let t = Tensor::from_vec(vec![0.0, 1.0, 1.0, 0.0], (4, 1)).unwrap();

    let mut first = None;
    let mut last = 0.0f32;
    for _ in 0..300 {
        opt.zero_grad().unwrap();
        let y = model.call(&x).unwrap();
        let l = loss.forward(&[&y, &t]).unwrap();
        loss.backward().unwrap();
        model.backward().unwrap();
        opt.step().unwrap();
        last = l.to_vec_f32().unwrap()[0];
        first.get_or_insert(last);
        session.clear_graph();
    }
    let first = first.unwrap();
    assert!(
        last < first * 0.5,
        "loss did not descend: {first} → {last}"
    );
}

#[test]
fn cnn_pipeline_shapes_flow_end_to_end() {
    let session = Session::with_workers(2);
    let backend = ComputeBackend::Cpu;

    // Conv(1→4, 3×3, pad 1) → ReLU → MaxPool(2×2) → Flatten → Linear → loss
    let mut model = Sequential::new(&session, &backend)
        .push(ConvNd::conv2d(&session, &backend, 1, 4, [3, 3], [1, 1], [1, 1], [1, 1], true).unwrap())
        .push(Activation::relu(&session, &backend))
        .push(MaxPoolNd::max_pool2d(&session, &backend, [2, 2], [2, 2]).unwrap())
        .push(Flatten::new(&session, &backend))
        .push(Linear::new(&session, &backend, 4 * 4 * 4, 3, true).unwrap());
    let mut loss = CrossEntropyLoss::new(&session, &backend, Reduction::Mean);

    let x = Tensor::from_fn((2, 1, 8, 8), |i| (i % 13) as f32 / 13.0);
    let labels = Tensor::from_vec_i32(vec![0, 2], (2,)).unwrap();

    let y = model.call(&x).unwrap();
    assert_eq!(y.dims(), vec![2, 3]);
    let l = loss.forward(&[&y, &labels]).unwrap();
    assert!(l.to_vec_f32().unwrap()[0].is_finite());

    loss.backward().unwrap();
    model.backward().unwrap();

    // The input gradient came back in input space.
    assert_eq!(x.grad().unwrap().dims(), vec![2, 1, 8, 8]);

    // The session recorded the five layer applications in order.
    let order = session.execution_order();
    assert_eq!(order.len(), 6); // five layers + the loss
    assert!(order[0].module.starts_with("Conv2d"));
    assert!(order[5].module.starts_with("CrossEntropyLoss"));
}

#[test]
fn adam_trains_a_regression() {
    let session = Session::with_workers(2);
    let backend = ComputeBackend::Cpu;

    // Fit y = 2x with a single linear unit.
    let mut model = Linear::new(&session, &backend, 1, 1, true).unwrap();
    let mut loss = MseLoss::new(&session, &backend, Reduction::Mean);
    let mut opt = Adam::new(
        &session,
        &backend,
        model.parameters(),
        0.05,
        (0.9, 0.999),
        1e-8,
        0.0,
        false,
    )
    .unwrap();

    let x = Tensor::from_vec(vec![-1.0, 0.0, 1.0, 2.0], (4, 1)).unwrap();
    let t = Tensor::from_vec(vec![-2.0, 0.0, 2.0, 4.0], (4, 1)).unwrap();

    for _ in 0..400 {
        opt.zero_grad().unwrap();
        let y = model.call(&x).unwrap();
        loss.forward(&[&y, &t]).unwrap();
        loss.backward().unwrap();
        model.backward().unwrap();
        opt.step().unwrap();
        session.clear_graph();
    }
    let w = model.weight().tensor().to_vec_f32().unwrap()[0];
    assert!((w - 2.0).abs() < 0.2, "weight {w} far from 2.0");
}
