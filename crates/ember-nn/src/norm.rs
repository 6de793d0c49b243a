use ember_core::{ComputeBackend, Error, Init, Parameter, Result, Session, Shape, Tensor};

use crate::module::{Module, ModuleCore};

// BatchNorm — per-channel batch normalization
//
// Input [batch, features, *rest]: statistics are computed per feature
// channel over the batch and any trailing spatial axes. Training mode
// uses the batch statistics and folds them into the running estimates;
// eval mode normalizes with the running estimates.
//
// The arithmetic is plain host math under either backend: the dual
// residency of the input handles the download transparently when the
// producing layer ran on the device.

pub struct BatchNorm {
    core: ModuleCore,
    num_features: usize,
    eps: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: Tensor,
    running_var: Tensor,
    training: bool,
    // Saved between forward and backward (training mode).
    saved_invstd: Vec<f32>,
    saved_xhat: Vec<f32>,
}

impl BatchNorm {
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        num_features: usize,
        eps: f32,
        momentum: f32,
    ) -> Result<Self> {
        let core = ModuleCore::new(session, backend, "BatchNorm");
        let gamma = core.register_weight(&Init::Ones, (num_features,))?;
        let beta = core.register_bias(true, &Init::Zeros, (num_features,))?;
        Ok(BatchNorm {
            core,
            num_features,
            eps,
            momentum,
            gamma,
            beta,
            running_mean: Tensor::zeros_untracked((num_features,)),
            running_var: Tensor::full((num_features,), 1.0),
            training: true,
            saved_invstd: Vec::new(),
            saved_xhat: Vec::new(),
        })
    }

    pub fn gamma(&self) -> &Parameter {
        &self.gamma
    }

    pub fn beta(&self) -> &Parameter {
        &self.beta
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }

    /// (batch, inner) split of the input: statistics pool over batch and
    /// inner, per feature channel.
    fn layout(&self, x: &Tensor) -> Result<(usize, usize)> {
        let dims = x.dims();
        if dims.len() < 2 || dims[1] != self.num_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![dims.first().copied().unwrap_or(1), self.num_features]),
                got: x.shape(),
            });
        }
        let inner: usize = dims[2..].iter().product();
        Ok((dims[0], inner))
    }
}

impl Module for BatchNorm {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let x = xs[0];
        let (batch, inner) = self.layout(x)?;
        let y = self.core.register_output(x.shape())?;
        let tickets = vec![
            self.core.stage_forward_arg("x", x),
            self.core.stage_backward_arg("x", x),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[x], &y);

        let c = self.num_features;
        let n = (batch * inner) as f32;
        let xv = x.to_vec_f32()?;
        let gv = self.gamma.tensor().to_vec_f32()?;
        let bv = self.beta.tensor().to_vec_f32()?;

        let (mean, var) = if self.training {
            let mut mean = vec![0.0f32; c];
            let mut var = vec![0.0f32; c];
            for b in 0..batch {
                for ch in 0..c {
                    let base = (b * c + ch) * inner;
                    for i in 0..inner {
                        mean[ch] += xv[base + i];
                    }
                }
            }
            for m in mean.iter_mut() {
                *m /= n;
            }
            for b in 0..batch {
                for ch in 0..c {
                    let base = (b * c + ch) * inner;
                    for i in 0..inner {
                        let d = xv[base + i] - mean[ch];
                        var[ch] += d * d;
                    }
                }
            }
            for v in var.iter_mut() {
                *v /= n;
            }
            // Fold the batch statistics into the running estimates.
            let momentum = self.momentum;
            self.running_mean.with_host_f32_mut(|rm| {
                for (r, &m) in rm.iter_mut().zip(mean.iter()) {
                    *r = (1.0 - momentum) * *r + momentum * m;
                }
            })?;
            self.running_var.with_host_f32_mut(|rv| {
                for (r, &v) in rv.iter_mut().zip(var.iter()) {
                    *r = (1.0 - momentum) * *r + momentum * v;
                }
            })?;
            (mean, var)
        } else {
            (
                self.running_mean.to_vec_f32()?,
                self.running_var.to_vec_f32()?,
            )
        };

        let invstd: Vec<f32> = var.iter().map(|&v| 1.0 / (v + self.eps).sqrt()).collect();
        let mut xhat = vec![0.0f32; xv.len()];
        let mut yv = vec![0.0f32; xv.len()];
        for b in 0..batch {
            for ch in 0..c {
                let base = (b * c + ch) * inner;
                for i in 0..inner {
                    let h = (xv[base + i] - mean[ch]) * invstd[ch];
                    xhat[base + i] = h;
                    yv[base + i] = gv[ch] * h + bv[ch];
                }
            }
        }
        if self.training {
            self.saved_invstd = invstd;
            self.saved_xhat = xhat;
        }
        y.set_host_f32(&yv)?;
        Ok(y)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        let y = self.core.output()?;
        let (batch, inner) = self.layout(&x)?;
        let c = self.num_features;
        let n = (batch * inner) as f32;

        let dy = y.grad()?;
        let dx = x.grad()?;
        let dyv = dy.to_vec_f32()?;
        let gv = self.gamma.tensor().to_vec_f32()?;
        if self.saved_xhat.len() != dyv.len() {
            return Err(Error::msg("batchnorm backward before a training forward"));
        }

        // Per-channel reductions of dy and dy·x̂.
        let mut dbeta = vec![0.0f32; c];
        let mut dgamma = vec![0.0f32; c];
        for b in 0..batch {
            for ch in 0..c {
                let base = (b * c + ch) * inner;
                for i in 0..inner {
                    dbeta[ch] += dyv[base + i];
                    dgamma[ch] += dyv[base + i] * self.saved_xhat[base + i];
                }
            }
        }
        self.gamma.tensor().grad()?.set_host_f32(&dgamma)?;
        self.beta.tensor().grad()?.set_host_f32(&dbeta)?;

        // dx = (γ·invstd / N) · (N·dy − Σdy − x̂·Σ(dy·x̂))
        let mut dxv = vec![0.0f32; dyv.len()];
        for b in 0..batch {
            for ch in 0..c {
                let base = (b * c + ch) * inner;
                let scale = gv[ch] * self.saved_invstd[ch] / n;
                for i in 0..inner {
                    dxv[base + i] = scale
                        * (n * dyv[base + i]
                            - dbeta[ch]
                            - self.saved_xhat[base + i] * dgamma[ch]);
                }
            }
        }
        dx.set_host_f32(&dxv)?;
        y.zero_grad()?;
        Ok(dx)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
