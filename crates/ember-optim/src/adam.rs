use ember_core::kernel::AdamKernel;
use ember_core::{ComputeBackend, Error, Parameter, Result, Session, Tensor};
use tracing::debug;

use crate::Optimizer;

/// Adam with decoupled hyperparameter validation and optional AMSGrad.
///
/// Per parameter, `optimizer_stuff` holds three same-shape tensors:
/// first moment, second moment, and the AMSGrad running maximum (unused
/// unless AMSGrad is on).
pub struct Adam {
    session: Session,
    backend: ComputeBackend,
    params: Vec<Parameter>,
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    weight_decay: f32,
    amsgrad: bool,
    counter: u32,
}

impl Adam {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        params: Vec<Parameter>,
        lr: f32,
        betas: (f32, f32),
        eps: f32,
        weight_decay: f32,
        amsgrad: bool,
    ) -> Result<Self> {
        if lr < 0.0 {
            return Err(Error::Unsupported(format!("invalid learning rate: {lr}")));
        }
        if eps < 0.0 {
            return Err(Error::Unsupported(format!("invalid epsilon value: {eps}")));
        }
        if !(0.0..1.0).contains(&betas.0) {
            return Err(Error::Unsupported(format!(
                "invalid beta parameter at index 0: {}",
                betas.0
            )));
        }
        if !(0.0..1.0).contains(&betas.1) {
            return Err(Error::Unsupported(format!(
                "invalid beta parameter at index 1: {}",
                betas.1
            )));
        }
        if weight_decay < 0.0 {
            return Err(Error::Unsupported(format!(
                "invalid weight_decay value: {weight_decay}"
            )));
        }
        debug!(params = params.len(), lr, "Adam ready");
        Ok(Adam {
            session: session.clone(),
            backend: backend.clone(),
            params,
            lr,
            betas,
            eps,
            weight_decay,
            amsgrad,
            counter: 0,
        })
    }

    /// One Adam update; `t` is the 1-based step count for bias correction.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn step_cpu(
        p: &mut [f32],
        g: &[f32],
        m: &mut [f32],
        r: &mut [f32],
        rmax: &mut [f32],
        lr: f32,
        betas: (f32, f32),
        eps: f32,
        weight_decay: f32,
        amsgrad: bool,
        t: u32,
    ) {
        let c1 = 1.0 - betas.0.powi(t as i32);
        let c2 = 1.0 - betas.1.powi(t as i32);
        for i in 0..p.len() {
            let gi = g[i] + weight_decay * p[i];
            m[i] = betas.0 * m[i] + (1.0 - betas.0) * gi;
            r[i] = betas.1 * r[i] + (1.0 - betas.1) * gi * gi;
            let m_hat = m[i] / c1;
            let r_hat = if amsgrad {
                rmax[i] = rmax[i].max(r[i]);
                rmax[i] / c2
            } else {
                r[i] / c2
            };
            p[i] -= lr * m_hat / (r_hat.sqrt() + eps);
        }
    }

    fn submit_param(&self, param: &Parameter, t: u32) -> Result<()> {
        param.tensor().wait()?;
        let p_t = param.tensor().clone();
        let g = param.tensor().grad()?;
        let stuff = param.optimizer_stuff(3)?;
        let (m, r, rmax) = match &stuff[..] {
            [m, r, rmax] => (m.clone(), r.clone(), rmax.clone()),
            _ => return Err(Error::msg("missing Adam moment buffers")),
        };
        let (lr, betas, eps, wd, amsgrad) =
            (self.lr, self.betas, self.eps, self.weight_decay, self.amsgrad);
        let backend = self.backend.clone();
        let handle = self.session.submit(move || match backend {
            ComputeBackend::Cpu => adam_task_cpu(&p_t, &g, &m, &r, &rmax, lr, betas, eps, wd, amsgrad, t),
            ComputeBackend::Device(ctx) => {
                let mut kernel = AdamKernel::new(&ctx, lr, betas.0, betas.1, eps, wd, amsgrad);
                kernel.stage(&p_t, &g, &m, &r, &rmax, t)?;
                kernel.run()
            }
        });
        param.tensor().set_pending(handle)
    }
}

#[allow(clippy::too_many_arguments)]
fn adam_task_cpu(
    p: &Tensor,
    g: &Tensor,
    m: &Tensor,
    r: &Tensor,
    rmax: &Tensor,
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    weight_decay: f32,
    amsgrad: bool,
    t: u32,
) -> Result<()> {
    let gv = g.to_vec_f32()?;
    let mut mv = m.to_vec_f32()?;
    let mut rv = r.to_vec_f32()?;
    let mut rmaxv = rmax.to_vec_f32()?;
    p.with_host_f32_mut_direct(|pv| {
        Adam::step_cpu(pv, &gv, &mut mv, &mut rv, &mut rmaxv, lr, betas, eps, weight_decay, amsgrad, t);
    })?;
    m.set_host_f32(&mv)?;
    r.set_host_f32(&rv)?;
    rmax.set_host_f32(&rmaxv)
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<()> {
        self.counter += 1;
        let t = self.counter;
        for param in &self.params {
            self.submit_param(param, t)?;
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
    fn rejects_invalid_betas() {
        let session = Session::with_workers(1);
        let backend = ComputeBackend::Cpu;
        let p = Parameter::new(&Init::Zeros, (2,), false, false).unwrap();
        assert!(Adam::new(
            &session,
            &backend,
            vec![p.clone()],
            1e-3,
            (1.5, 0.999),
            1e-8,
            0.0,
            false
        )
        .is_err());
        assert!(Adam::new(&session, &backend, vec![p], 1e-3, (0.9, 0.999), -1.0, 0.0, false).is_err());
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let p = Parameter::new(&Init::Zeros, (3,), false, false).unwrap();
        p.tensor().grad().unwrap().set_host_f32(&[1.0, -1.0, 2.0]).unwrap();
        let mut opt = Adam::new(
            &session,
            &backend,
            vec![p.clone()],
            0.1,
            (0.9, 0.999),
            1e-8,
            0.0,
            false,
        )
        .unwrap();
        opt.step().unwrap();
        // Bias correction makes the first step ≈ lr·sign(g).
        let got = p.tensor().to_vec_f32().unwrap();
        assert!((got[0] + 0.1).abs() < 1e-4);
        assert!((got[1] - 0.1).abs() < 1e-4);
        assert!((got[2] + 0.1).abs() < 1e-4);
    }

    #[test]
    fn amsgrad_keeps_the_running_maximum() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let p = Parameter::new(&Init::Zeros, (1,), false, false).unwrap();
        let mut opt = Adam::new(
            &session,
            &backend,
            vec![p.clone()],
            0.1,
            (0.9, 0.999),
            1e-8,
            0.0,
            true,
        )
        .unwrap();
        p.tensor().grad().unwrap().set_host_f32(&[4.0]).unwrap();
        opt.step().unwrap();
        p.tensor().wait().unwrap();
        let rmax_after_big = p.optimizer_stuff(3).unwrap()[2].to_vec_f32().unwrap()[0];
        p.tensor().grad().unwrap().set_host_f32(&[0.1]).unwrap();
        opt.step().unwrap();
        p.tensor().wait().unwrap();
        let rmax_after_small = p.optimizer_stuff(3).unwrap()[2].to_vec_f32().unwrap()[0];
        // A smaller gradient does not shrink the maximum.
        assert!(rmax_after_small >= rmax_after_big);
    }
}
