use ember_core::{ComputeBackend, DType, Error, Result, Session, Shape, Tensor};

use crate::module::{Module, ModuleCore};

// Losses. Scalar-output modules: forward takes (prediction, target) and
// returns a 1-element tensor; backward writes the prediction gradient
// and returns it. The arithmetic runs on the host under either backend —
// dual residency downloads device-produced predictions transparently.

/// How a loss folds its per-element terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Mean,
    Sum,
}

impl Reduction {
    fn scale(&self, count: usize) -> f32 {
        match self {
            Reduction::Mean => 1.0 / count as f32,
            Reduction::Sum => 1.0,
        }
    }
}

/// Mean-squared-error loss: `reduce((x - t)²)`.
pub struct MseLoss {
    core: ModuleCore,
    reduction: Reduction,
}

impl MseLoss {
    pub fn new(session: &Session, backend: &ComputeBackend, reduction: Reduction) -> Self {
        MseLoss {
            core: ModuleCore::new(session, backend, "MSELoss"),
            reduction,
        }
    }
}

impl Module for MseLoss {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let (x, target) = (xs[0], xs[1]);
        if x.shape() != target.shape() {
            return Err(Error::ShapeMismatch {
                expected: x.shape(),
                got: target.shape(),
            });
        }
        let y = self.core.register_output((1,))?;
        let tickets = vec![
            self.core.stage_forward_arg("x", x),
            self.core.stage_forward_arg("target", target),
            self.core.stage_backward_arg("x", x),
            self.core.stage_backward_arg("target", target),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[x, target], &y);

        let xv = x.to_vec_f32()?;
        let tv = target.to_vec_f32()?;
        let scale = self.reduction.scale(xv.len());
        let loss: f32 = xv
            .iter()
            .zip(tv.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            * scale;
        y.set_host_f32(&[loss])?;
        Ok(y)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        let target = self.core.backward_arg("target")?;
        let xv = x.to_vec_f32()?;
        let tv = target.to_vec_f32()?;
        let scale = 2.0 * self.reduction.scale(xv.len());
        let dx = x.grad()?;
        dx.with_host_f32_mut(|out| {
            for (i, o) in out.iter_mut().enumerate() {
                *o = scale * (xv[i] - tv[i]);
            }
        })?;
        Ok(dx)
    }
}

/// Cross-entropy loss over logits: softmax rows, then
/// `reduce(-Σ t·log p)`. Integer targets are one-hot expanded against
/// the class count; f32 targets are taken as already one-hot.
pub struct CrossEntropyLoss {
    core: ModuleCore,
    reduction: Reduction,
    /// Softmax of the last forward's logits, kept for backward.
    probs: Vec<f32>,
}

impl CrossEntropyLoss {
    pub fn new(session: &Session, backend: &ComputeBackend, reduction: Reduction) -> Self {
        CrossEntropyLoss {
            core: ModuleCore::new(session, backend, "CrossEntropyLoss"),
            reduction,
            probs: Vec::new(),
        }
    }

    /// Numerically stable row softmax.
    fn softmax(logits: &[f32], rows: usize, classes: usize) -> Vec<f32> {
        let mut p = vec![0.0f32; logits.len()];
        for r in 0..rows {
            let row = &logits[r * classes..(r + 1) * classes];
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0f32;
            for (j, &v) in row.iter().enumerate() {
                let e = (v - max).exp();
                p[r * classes + j] = e;
                denom += e;
            }
            for j in 0..classes {
                p[r * classes + j] /= denom;
            }
        }
        p
    }
}

impl Module for CrossEntropyLoss {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let (logits, target) = (xs[0], xs[1]);
        let dims = logits.dims();
        if dims.len() != 2 {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![0, 0]),
                got: logits.shape(),
            });
        }
        let (rows, classes) = (dims[0], dims[1]);

        // Label targets expand to one-hot against the class count, which
        // also validates their range.
        let onehot = if target.dtype() == DType::I32 {
            target.onehot(Some(classes))?
        } else {
            target.clone()
        };
        if onehot.size() != logits.size() {
            return Err(Error::ShapeMismatch {
                expected: logits.shape(),
                got: onehot.shape(),
            });
        }

        let y = self.core.register_output((1,))?;
        let tickets = vec![
            self.core.stage_forward_arg("x", logits),
            self.core.stage_forward_arg("target", &onehot),
            self.core.stage_backward_arg("x", logits),
            self.core.stage_backward_arg("target", &onehot),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[logits, target], &y);

        let xv = logits.to_vec_f32()?;
        let tv = onehot.to_vec_f32()?;
        let p = Self::softmax(&xv, rows, classes);
        let scale = self.reduction.scale(rows);
        let loss: f32 = p
            .iter()
            .zip(tv.iter())
            .map(|(&pi, &ti)| {
                if ti > 0.0 {
                    -ti * (pi + 1e-12).ln()
                } else {
                    0.0
                }
            })
            .sum::<f32>()
            * scale;
        self.probs = p;
        y.set_host_f32(&[loss])?;
        Ok(y)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        let target = self.core.backward_arg("target")?;
        let rows = x.dims()[0];
        if self.probs.len() != x.size() {
            return Err(Error::msg("cross-entropy backward before forward"));
        }
        let tv = target.to_vec_f32()?;
        let scale = self.reduction.scale(rows);
        let dx = x.grad()?;
        let probs = &self.probs;
        dx.with_host_f32_mut(|out| {
            for (i, o) in out.iter_mut().enumerate() {
                *o = scale * (probs[i] - tv[i]);
            }
        })?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_value_and_gradient() {
        let session = Session::with_workers(2);
        let mut loss = MseLoss::new(&session, &ComputeBackend::Cpu, Reduction::Mean);
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        let t = Tensor::from_vec(vec![1.0, 1.0, 1.0, 1.0], (2, 2)).unwrap();
        let y = loss.forward(&[&x, &t]).unwrap();
        // mean of [0, 1, 4, 9] = 3.5
        assert!((y.to_vec_f32().unwrap()[0] - 3.5).abs() < 1e-6);

        let dx = loss.backward().unwrap();
        // 2·(x−t)/N = [0, 0.5, 1.0, 1.5]
        let got = dx.to_vec_f32().unwrap();
        for (g, e) in got.iter().zip([0.0, 0.5, 1.0, 1.5]) {
            assert!((g - e).abs() < 1e-6);
        }
    }

    #[test]
    fn mse_rejects_shape_mismatch() {
        let session = Session::with_workers(1);
        let mut loss = MseLoss::new(&session, &ComputeBackend::Cpu, Reduction::Mean);
        let x = Tensor::ones((2, 2));
        let t = Tensor::ones((4,));
        assert!(matches!(
            loss.forward(&[&x, &t]).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn cross_entropy_uniform_logits() {
        let session = Session::with_workers(2);
        let mut loss = CrossEntropyLoss::new(&session, &ComputeBackend::Cpu, Reduction::Mean);
        let logits = Tensor::zeros((2, 4));
        let labels = Tensor::from_vec_i32(vec![0, 3], (2,)).unwrap();
        let y = loss.forward(&[&logits, &labels]).unwrap();
        // Uniform softmax over 4 classes: −ln(1/4)
        let expected = (4.0f32).ln();
        assert!((y.to_vec_f32().unwrap()[0] - expected).abs() < 1e-5);

        let dx = loss.backward().unwrap();
        let got = dx.to_vec_f32().unwrap();
        // p − t scaled by 1/rows: 0.25/2 off-target, (0.25−1)/2 on-target.
        assert!((got[0] - (0.25 - 1.0) / 2.0).abs() < 1e-6);
        assert!((got[1] - 0.25 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_rejects_bad_labels() {
        let session = Session::with_workers(1);
        let mut loss = CrossEntropyLoss::new(&session, &ComputeBackend::Cpu, Reduction::Mean);
        let logits = Tensor::zeros((1, 3));
        let labels = Tensor::from_vec_i32(vec![7], (1,)).unwrap();
        assert!(matches!(
            loss.forward(&[&logits, &labels]).unwrap_err(),
            Error::InvalidLabel { .. }
        ));
    }
}
