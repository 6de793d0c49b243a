use ember_core::kernel::SgdKernel;
use ember_core::{ComputeBackend, Error, Parameter, Result, Session, Tensor};
use tracing::debug;

use crate::Optimizer;

/// Stochastic gradient descent with optional momentum, dampening,
/// weight decay, and Nesterov acceleration.
pub struct Sgd {
    session: Session,
    backend: ComputeBackend,
    params: Vec<Parameter>,
    lr: f32,
    momentum: f32,
    dampening: f32,
    weight_decay: f32,
    nesterov: bool,
}

impl Sgd {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        params: Vec<Parameter>,
        lr: f32,
        momentum: f32,
        dampening: f32,
        weight_decay: f32,
        nesterov: bool,
    ) -> Result<Self> {
        if lr < 0.0 {
            return Err(Error::Unsupported(format!("invalid learning rate: {lr}")));
        }
        if momentum < 0.0 {
            return Err(Error::Unsupported(format!(
                "invalid momentum value: {momentum}"
            )));
        }
        if weight_decay < 0.0 {
            return Err(Error::Unsupported(format!(
                "invalid weight_decay value: {weight_decay}"
            )));
        }
        if nesterov && (momentum <= 0.0 || dampening != 0.0) {
            return Err(Error::Unsupported(
                "Nesterov momentum requires a momentum and zero dampening".to_string(),
            ));
        }
        debug!(params = params.len(), lr, momentum, "SGD ready");
        Ok(Sgd {
            session: session.clone(),
            backend: backend.clone(),
            params,
            lr,
            momentum,
            dampening,
            weight_decay,
            nesterov,
        })
    }

    /// The update formula shared by the CPU task and the device kernel's
    /// reference tests.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn step_cpu(
        p: &mut [f32],
        g: &[f32],
        v: &mut [f32],
        lr: f32,
        momentum: f32,
        dampening: f32,
        weight_decay: f32,
        nesterov: bool,
    ) {
        for i in 0..p.len() {
            let mut gi = g[i] + weight_decay * p[i];
            if momentum != 0.0 {
                let vi = momentum * v[i] + (1.0 - dampening) * gi;
                v[i] = vi;
                gi = if nesterov { gi + momentum * vi } else { vi };
            }
            p[i] -= lr * gi;
        }
    }

    fn submit_param(&self, param: &Parameter) -> Result<()> {
        // Steps for the same parameter must not overlap: join the
        // previous in-flight update before queueing the next.
        param.tensor().wait()?;
        let p_t = param.tensor().clone();
        let g = param.tensor().grad()?;
        let v = param
            .optimizer_stuff(1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::msg("missing momentum buffer"))?;
        let (lr, mu, damp, wd, nesterov) = (
            self.lr,
            self.momentum,
            self.dampening,
            self.weight_decay,
            self.nesterov,
        );
        let backend = self.backend.clone();
        let handle = self.session.submit(move || match backend {
            ComputeBackend::Cpu => sgd_task_cpu(&p_t, &g, &v, lr, mu, damp, wd, nesterov),
            ComputeBackend::Device(ctx) => {
                let mut kernel = SgdKernel::new(&ctx, lr, mu, damp, wd, nesterov);
                kernel.stage(&p_t, &g, &v)?;
                kernel.run()
            }
        });
        param.tensor().set_pending(handle)
    }
}

#[allow(clippy::too_many_arguments)]
fn sgd_task_cpu(
    p: &Tensor,
    g: &Tensor,
    v: &Tensor,
    lr: f32,
    momentum: f32,
    dampening: f32,
    weight_decay: f32,
    nesterov: bool,
) -> Result<()> {
    let gv = g.to_vec_f32()?;
    let mut vv = v.to_vec_f32()?;
    p.with_host_f32_mut_direct(|pv| {
        Sgd::step_cpu(pv, &gv, &mut vv, lr, momentum, dampening, weight_decay, nesterov);
    })?;
    v.set_host_f32(&vv)
}

impl Optimizer for Sgd {
    fn step(&mut self) -> Result<()> {
        for param in &self.params {
            self.submit_param(param)?;
        }
        Ok(())
    }

    fn params(&self) -> &[Parameter] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Init;

    fn fixture() -> (Session, ComputeBackend, Parameter) {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let p = Parameter::new(&Init::Ones, (4,), false, false).unwrap();
        (session, backend, p)
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        let (session, backend, p) = fixture();
        assert!(Sgd::new(&session, &backend, vec![p.clone()], -0.1, 0.0, 0.0, 0.0, false).is_err());
        assert!(Sgd::new(&session, &backend, vec![p.clone()], 0.1, -1.0, 0.0, 0.0, false).is_err());
        // Nesterov without momentum.
        assert!(Sgd::new(&session, &backend, vec![p], 0.1, 0.0, 0.0, 0.0, true).is_err());
    }

    #[test]
    fn moves_parameter_against_gradient() {
        let (session, backend, p) = fixture();
        p.tensor().grad().unwrap().set_host_f32(&[1.0; 4]).unwrap();
        let mut opt =
            Sgd::new(&session, &backend, vec![p.clone()], 0.5, 0.0, 0.0, 0.0, false).unwrap();
        opt.step().unwrap();
        // The read joins the queued step before observing the value.
        assert_eq!(p.tensor().to_vec_f32().unwrap(), vec![0.5; 4]);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let (session, backend, p) = fixture();
        p.tensor().grad().unwrap().set_host_f32(&[1.0; 4]).unwrap();
        let mut opt =
            Sgd::new(&session, &backend, vec![p.clone()], 0.1, 0.9, 0.0, 0.0, false).unwrap();
        opt.step().unwrap();
        opt.step().unwrap();
        // v1 = 1, v2 = 0.9 + 1 = 1.9 → p = 1 − 0.1·(1 + 1.9) = 0.71
        let got = p.tensor().to_vec_f32().unwrap();
        for v in got {
            assert!((v - 0.71).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_grad_then_step_is_identity_without_decay() {
        let (session, backend, p) = fixture();
        p.tensor().grad().unwrap().set_host_f32(&[3.0; 4]).unwrap();
        let mut opt =
            Sgd::new(&session, &backend, vec![p.clone()], 0.5, 0.0, 0.0, 0.0, false).unwrap();
        opt.zero_grad().unwrap();
        opt.step().unwrap();
        assert_eq!(p.tensor().to_vec_f32().unwrap(), vec![1.0; 4]);
    }
}
