// Optimizer CPU/device parity: the same parameter, gradient, and
// hyperparameters stepped through both backends must land on the same
// values. Skipped (early return) without a usable GPU.

use ember_core::{ComputeBackend, DeviceContext, Init, Parameter, Session};
use ember_optim::{Adam, Optimizer, RmsProp, Sgd};
use rand::Rng;

fn device_backend() -> Option<ComputeBackend> {
    DeviceContext::new(0).ok().map(ComputeBackend::Device)
}

fn pair(n: usize) -> (Parameter, Parameter, Vec<f32>) {
    let mut rng = rand::thread_rng();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let grad: Vec<f32> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let a = Parameter::new(&Init::Zeros, (n,), false, false).unwrap();
    let b = Parameter::new(&Init::Zeros, (n,), false, false).unwrap();
    for p in [&a, &b] {
        p.tensor().set_host_f32(&data).unwrap();
        p.tensor().grad().unwrap().set_host_f32(&grad).unwrap();
    }
    (a, b, grad)
}

fn assert_close(got: &[f32], want: &[f32]) {
    for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
        assert!(
            (g - w).abs() <= 1e-4 * w.abs().max(1.0),
            "index {i}: {g} vs {w}"
        );
    }
}

#[test]
fn sgd_step_parity() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let (p_cpu, p_gpu, grad) = pair(513);

    let mut on_cpu = Sgd::new(&session, &ComputeBackend::Cpu, vec![p_cpu.clone()], 0.1, 0.9, 0.0, 1e-2, false).unwrap();
    let mut on_gpu = Sgd::new(&session, &gpu, vec![p_gpu.clone()], 0.1, 0.9, 0.0, 1e-2, false).unwrap();
    for _ in 0..3 {
        // Re-set the gradient each round: steps mutate the parameter, and
        // weight decay makes the effective gradient parameter-dependent.
        p_cpu.tensor().grad().unwrap().set_host_f32(&grad).unwrap();
        p_gpu.tensor().grad().unwrap().set_host_f32(&grad).unwrap();
        on_cpu.step().unwrap();
        on_gpu.step().unwrap();
    }
    assert_close(
        &p_gpu.tensor().to_vec_f32().unwrap(),
        &p_cpu.tensor().to_vec_f32().unwrap(),
    );
}

#[test]
fn adam_step_parity() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let (p_cpu, p_gpu, _grad) = pair(257);

    let mut on_cpu = Adam::new(&session, &ComputeBackend::Cpu, vec![p_cpu.clone()], 0.01, (0.9, 0.999), 1e-8, 0.0, true).unwrap();
    let mut on_gpu = Adam::new(&session, &gpu, vec![p_gpu.clone()], 0.01, (0.9, 0.999), 1e-8, 0.0, true).unwrap();
    for _ in 0..4 {
        on_cpu.step().unwrap();
        on_gpu.step().unwrap();
    }
    assert_close(
        &p_gpu.tensor().to_vec_f32().unwrap(),
        &p_cpu.tensor().to_vec_f32().unwrap(),
    );
}

#[test]
fn rmsprop_step_parity() {
    let Some(gpu) = device_backend() else { return };
    let session = Session::new();
    let (p_cpu, p_gpu, _grad) = pair(129);

    let mut on_cpu = RmsProp::new(&session, &ComputeBackend::Cpu, vec![p_cpu.clone()], 0.01, 0.99, 1e-8, 0.0).unwrap();
    let mut on_gpu = RmsProp::new(&session, &gpu, vec![p_gpu.clone()], 0.01, 0.99, 1e-8, 0.0).unwrap();
    for _ in 0..3 {
        on_cpu.step().unwrap();
        on_gpu.step().unwrap();
    }
    assert_close(
        &p_gpu.tensor().to_vec_f32().unwrap(),
        &p_cpu.tensor().to_vec_f32().unwrap(),
    );
}
