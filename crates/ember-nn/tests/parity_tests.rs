// Layer-level CPU/device parity.
//
// Each test builds the same layer twice — once on the CPU backend, once
// on the device backend — feeds both the same input, and compares
// outputs (and input gradients) within the float32 contract. Tests
// return early when no device is available.

use ember_core::{ComputeBackend, DeviceContext, Init, Session, Tensor};
use ember_nn::{ConvNd, Linear, MaxPoolNd, Module};
use rand::Rng;

fn device_backend() -> Option<ComputeBackend> {
    DeviceContext::new(0).ok().map(ComputeBackend::Device)
}

fn random_vec(n: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect()
}

fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
        assert!((g - w).abs() <= tol * w.abs().max(1.0), "index {i}: {g} vs {w}");
    }
}

#[test]
fn linear_identity_cpu_matches_device() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let cpu = ComputeBackend::Cpu;

    let mut on_cpu = Linear::with_init(&session, &cpu, 5, 5, true, Init::Identity).unwrap();
    let mut on_gpu = Linear::with_init(&session, &gpu, 5, 5, true, Init::Identity).unwrap();

    let x = Tensor::ones((3, 5));
    let y_cpu = on_cpu.call(&x).unwrap().to_vec_f32().unwrap();
    let y_gpu = on_gpu.call(&x).unwrap().to_vec_f32().unwrap();
    assert_close(&y_gpu, &y_cpu, 1e-5);
    for v in y_cpu {
        assert!((v - 1.0).abs() < 1e-5);
    }
}

#[test]
fn linear_random_forward_backward_parity() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let cpu = ComputeBackend::Cpu;
    let (batch, fin, fout) = (6, 11, 7);

    let mut on_cpu = Linear::new(&session, &cpu, fin, fout, true).unwrap();
    let mut on_gpu = Linear::new(&session, &gpu, fin, fout, true).unwrap();
    // Same weights on both sides.
    let wv = random_vec(fout * fin);
    let bv = random_vec(fout);
    for layer in [&on_cpu, &on_gpu] {
        layer.weight().tensor().set_host_f32(&wv).unwrap();
        layer.bias().tensor().set_host_f32(&bv).unwrap();
    }

    let xv = random_vec(batch * fin);
    let x_cpu = Tensor::from_vec(xv.clone(), (batch, fin)).unwrap();
    let x_gpu = Tensor::from_vec(xv, (batch, fin)).unwrap();

    let y_cpu = on_cpu.call(&x_cpu).unwrap();
    let y_gpu = on_gpu.call(&x_gpu).unwrap();
    assert_close(
        &y_gpu.to_vec_f32().unwrap(),
        &y_cpu.to_vec_f32().unwrap(),
        1e-4,
    );

    let dyv = random_vec(batch * fout);
    y_cpu.grad().unwrap().set_host_f32(&dyv).unwrap();
    y_gpu.grad().unwrap().set_host_f32(&dyv).unwrap();
    let dx_cpu = on_cpu.backward().unwrap();
    let dx_gpu = on_gpu.backward().unwrap();
    assert_close(
        &dx_gpu.to_vec_f32().unwrap(),
        &dx_cpu.to_vec_f32().unwrap(),
        1e-4,
    );
    assert_close(
        &on_gpu.weight().tensor().grad().unwrap().to_vec_f32().unwrap(),
        &on_cpu.weight().tensor().grad().unwrap().to_vec_f32().unwrap(),
        1e-4,
    );
}

#[test]
fn conv2d_forward_backward_parity() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let cpu = ComputeBackend::Cpu;

    let build = |backend: &ComputeBackend| {
        ConvNd::conv2d(&session, backend, 3, 4, [3, 3], [1, 1], [1, 1], [1, 1], true).unwrap()
    };
    let mut on_cpu = build(&cpu);
    let mut on_gpu = build(&gpu);
    let wv = random_vec(4 * 3 * 3 * 3);
    let bv = random_vec(4);
    for layer in [&on_cpu, &on_gpu] {
        layer.weight().tensor().set_host_f32(&wv).unwrap();
        layer.bias().tensor().set_host_f32(&bv).unwrap();
    }

    let xv = random_vec(2 * 3 * 8 * 8);
    let x_cpu = Tensor::from_vec(xv.clone(), (2, 3, 8, 8)).unwrap();
    let x_gpu = Tensor::from_vec(xv, (2, 3, 8, 8)).unwrap();

    let y_cpu = on_cpu.call(&x_cpu).unwrap();
    let y_gpu = on_gpu.call(&x_gpu).unwrap();
    assert_close(
        &y_gpu.to_vec_f32().unwrap(),
        &y_cpu.to_vec_f32().unwrap(),
        1e-4,
    );

    let dyv = random_vec(y_cpu.size());
    y_cpu.grad().unwrap().set_host_f32(&dyv).unwrap();
    y_gpu.grad().unwrap().set_host_f32(&dyv).unwrap();
    let dx_cpu = on_cpu.backward().unwrap();
    let dx_gpu = on_gpu.backward().unwrap();
    assert_close(
        &dx_gpu.to_vec_f32().unwrap(),
        &dx_cpu.to_vec_f32().unwrap(),
        1e-4,
    );
    assert_close(
        &on_gpu.weight().tensor().grad().unwrap().to_vec_f32().unwrap(),
        &on_cpu.weight().tensor().grad().unwrap().to_vec_f32().unwrap(),
        1e-4,
    );
}

#[test]
fn max_pool_parity() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let cpu = ComputeBackend::Cpu;

    let mut on_cpu = MaxPoolNd::max_pool2d(&session, &cpu, [2, 2], [2, 2]).unwrap();
    let mut on_gpu = MaxPoolNd::max_pool2d(&session, &gpu, [2, 2], [2, 2]).unwrap();

    let xv = random_vec(2 * 3 * 6 * 6);
    let x_cpu = Tensor::from_vec(xv.clone(), (2, 3, 6, 6)).unwrap();
    let x_gpu = Tensor::from_vec(xv, (2, 3, 6, 6)).unwrap();

    let y_cpu = on_cpu.call(&x_cpu).unwrap();
    let y_gpu = on_gpu.call(&x_gpu).unwrap();
    assert_close(
        &y_gpu.to_vec_f32().unwrap(),
        &y_cpu.to_vec_f32().unwrap(),
        1e-5,
    );

    let dyv = random_vec(y_cpu.size());
    y_cpu.grad().unwrap().set_host_f32(&dyv).unwrap();
    y_gpu.grad().unwrap().set_host_f32(&dyv).unwrap();
    let dx_cpu = on_cpu.backward().unwrap();
    let dx_gpu = on_gpu.backward().unwrap();
    assert_close(
        &dx_gpu.to_vec_f32().unwrap(),
        &dx_cpu.to_vec_f32().unwrap(),
        1e-5,
    );
}
