use ember_core::kernel::RmsPropKernel;
use ember_core::{ComputeBackend, Error, Parameter, Result, Session, Tensor};
use tracing::debug;

use crate::Optimizer;

/// RMSProp: exponential moving average of squared gradients normalizes
/// the step size per element.
pub struct RmsProp {
    session: Session,
    backend: ComputeBackend,
    params: Vec<Parameter>,
    lr: f32,
    alpha: f32,
    eps: f32,
    weight_decay: f32,
}

impl RmsProp {
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        params: Vec<Parameter>,
        lr: f32,
        alpha: f32,
        eps: f32,
        weight_decay: f32,
    ) -> Result<Self> {
        if lr < 0.0 {
            return Err(Error::Unsupported(format!("invalid learning rate: {lr}")));
        }
        if eps < 0.0 {
            return Err(Error::Unsupported(format!("invalid epsilon value: {eps}")));
        }
        if alpha < 0.0 {
            return Err(Error::Unsupported(format!("invalid alpha value: {alpha}")));
        }
        if weight_decay < 0.0 {
            return Err(Error::Unsupported(format!(
                "invalid weight_decay value: {weight_decay}"
            )));
        }
        debug!(params = params.len(), lr, alpha, "RMSProp ready");
        Ok(RmsProp {
            session: session.clone(),
            backend: backend.clone(),
            params,
            lr,
            alpha,
            eps,
            weight_decay,
        })
    }

    pub(crate) fn step_cpu(
        p: &mut [f32],
        g: &[f32],
        v: &mut [f32],
        lr: f32,
        alpha: f32,
        eps: f32,
        weight_decay: f32,
    ) {
        for i in 0..p.len() {
            let gi = g[i] + weight_decay * p[i];
            v[i] = alpha * v[i] + (1.0 - alpha) * gi * gi;
            p[i] -= lr * gi / (v[i].sqrt() + eps);
        }
    }

    fn submit_param(&self, param: &Parameter) -> Result<()> {
        param.tensor().wait()?;
        let p_t = param.tensor().clone();
        let g = param.tensor().grad()?;
        let v = param
            .optimizer_stuff(1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::msg("missing accumulator buffer"))?;
        let (lr, alpha, eps, wd) = (self.lr, self.alpha, self.eps, self.weight_decay);
        let backend = self.backend.clone();
        let handle = self.session.submit(move || match backend {
            ComputeBackend::Cpu => rmsprop_task_cpu(&p_t, &g, &v, lr, alpha, eps, wd),
            ComputeBackend::Device(ctx) => {
                let mut kernel = RmsPropKernel::new(&ctx, lr, alpha, eps, wd);
                kernel.stage(&p_t, &g, &v)?;
                kernel.run()
            }
        });
        param.tensor().set_pending(handle)
    }
}

fn rmsprop_task_cpu(
    p: &Tensor,
    g: &Tensor,
    v: &Tensor,
    lr: f32,
    alpha: f32,
    eps: f32,
    weight_decay: f32,
) -> Result<()> {
    let gv = g.to_vec_f32()?;
    let mut vv = v.to_vec_f32()?;
    p.with_host_f32_mut_direct(|pv| {
        RmsProp::step_cpu(pv, &gv, &mut vv, lr, alpha, eps, weight_decay);
    })?;
    v.set_host_f32(&vv)
}

impl Optimizer for RmsProp {
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

    #[test]
    fn rejects_negative_alpha() {
        let session = Session::with_workers(1);
        let p = Parameter::new(&Init::Zeros, (2,), false, false).unwrap();
        assert!(
            RmsProp::new(&session, &ComputeBackend::Cpu, vec![p], 0.01, -0.5, 1e-8, 0.0).is_err()
        );
    }

    #[test]
    fn normalizes_step_by_gradient_magnitude() {
        let session = Session::with_workers(2);
        let p = Parameter::new(&Init::Zeros, (2,), false, false).unwrap();
        p.tensor().grad().unwrap().set_host_f32(&[10.0, 0.1]).unwrap();
        let mut opt =
            RmsProp::new(&session, &ComputeBackend::Cpu, vec![p.clone()], 0.01, 0.9, 1e-8, 0.0)
                .unwrap();
        opt.step().unwrap();
        let got = p.tensor().to_vec_f32().unwrap();
        // v = 0.1·g² → step = lr·g/(√v) ≈ lr/√0.1, independent of |g|.
        let expected = -0.01 / 0.1f32.sqrt();
        assert!((got[0] - expected).abs() < 1e-4);
        assert!((got[1] - expected).abs() < 1e-4);
    }
}
