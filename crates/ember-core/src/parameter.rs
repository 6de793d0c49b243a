use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

// Parameter — a trainable tensor plus its optimizer baggage
//
// Parameters are created once, at layer construction, from an Init rule,
// and never resized. The optimizer attaches `optimizer_stuff`: auxiliary
// tensors of identical shape (momentum, second-moment accumulators),
// allocated lazily on the first step so unused slots cost nothing.

/// Initialization rule for a freshly constructed parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Constant(f32),
    Uniform { low: f32, high: f32 },
    /// Glorot: U(-a, a) with a = sqrt(6 / (fan_in + fan_out)).
    XavierUniform,
    /// He: U(-b, b) with b = sqrt(3 * gain² / fan_in), gain² = 2 / (1 + a²).
    KaimingUniform { a: f32 },
    /// Identity matrix; requires a square 2-D shape.
    Identity,
}

/// (fan_in, fan_out) for a parameter shape.
///
/// 2-D weights are [out, in]; convolution weights are
/// [out_channels, in_channels, *kernel] with the receptive field folded
/// into both fans.
fn compute_fans(shape: &Shape) -> (f32, f32) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f32, dims[0] as f32),
        2 => (dims[1] as f32, dims[0] as f32),
        _ => {
            let receptive: usize = dims[2..].iter().product();
            (
                (dims[1] * receptive) as f32,
                (dims[0] * receptive) as f32,
            )
        }
    }
}

impl Init {
    /// Build a tensor of `shape` following this rule.
    pub fn materialize(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let n = shape.elem_count();
        match *self {
            Init::Zeros => Tensor::from_vec(vec![0.0; n], shape),
            Init::Ones => Tensor::from_vec(vec![1.0; n], shape),
            Init::Constant(c) => Tensor::from_vec(vec![c; n], shape),
            Init::Uniform { low, high } => {
                let mut rng = rand::thread_rng();
                let data = (0..n).map(|_| rng.gen_range(low..high)).collect();
                Tensor::from_vec(data, shape)
            }
            Init::XavierUniform => {
                let (fan_in, fan_out) = compute_fans(&shape);
                let a = (6.0 / (fan_in + fan_out)).sqrt();
                Init::Uniform { low: -a, high: a }.materialize(shape)
            }
            Init::KaimingUniform { a } => {
                let (fan_in, _) = compute_fans(&shape);
                let gain_sq = 2.0 / (1.0 + a * a);
                let bound = (3.0 * gain_sq / fan_in).sqrt();
                Init::Uniform {
                    low: -bound,
                    high: bound,
                }
                .materialize(shape)
            }
            Init::Identity => {
                let dims = shape.dims();
                if dims.len() != 2 || dims[0] != dims[1] {
                    return Err(Error::Unsupported(format!(
                        "identity init needs a square 2-D shape, got {shape}"
                    )));
                }
                let n_side = dims[0];
                let mut data = vec![0.0f32; n_side * n_side];
                for i in 0..n_side {
                    data[i * n_side + i] = 1.0;
                }
                Tensor::from_vec(data, shape)
            }
        }
    }
}

struct ParamInner {
    tensor: Tensor,
    shared: bool,
    bias: bool,
    /// Optimizer scratch: same-shape auxiliary tensors, lazily allocated.
    optimizer_stuff: Mutex<Vec<Tensor>>,
}

/// Shared handle to one trainable parameter.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<ParamInner>,
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parameter({:?}, bias={}, shared={})",
            self.inner.tensor, self.inner.bias, self.inner.shared
        )
    }
}

impl Parameter {
    /// Construct from an initialization rule.
    pub fn new(init: &Init, shape: impl Into<Shape>, shared: bool, bias: bool) -> Result<Self> {
        Ok(Parameter {
            inner: Arc::new(ParamInner {
                tensor: init.materialize(shape)?,
                shared,
                bias,
                optimizer_stuff: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The 1-element stand-in registered when a layer is built without a
    /// bias, so layer code can branch on `use_bias` without holding an
    /// optional parameter.
    pub fn placeholder() -> Result<Self> {
        Self::new(&Init::Zeros, (1,), false, true)
    }

    /// The underlying tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.inner.tensor
    }

    pub fn is_bias(&self) -> bool {
        self.inner.bias
    }

    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// Zero the gradient (no-op before the gradient's first use), then
    /// make sure any in-flight step has landed.
    pub fn zero_grad(&self) -> Result<()> {
        self.inner.tensor.zero_grad()
    }

    /// Ensure `count` same-shape scratch tensors exist and return them.
    /// The first optimizer step allocates; later steps reuse.
    pub fn optimizer_stuff(&self, count: usize) -> Result<Vec<Tensor>> {
        let mut stuff = self
            .inner
            .optimizer_stuff
            .lock()
            .map_err(|_| Error::msg("parameter scratch lock poisoned"))?;
        while stuff.len() < count {
            stuff.push(Tensor::zeros_untracked(self.inner.tensor.shape()));
        }
        Ok(stuff.iter().take(count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kaiming_uniform_stays_in_bounds() {
        // fan_in = 100, a = 0 → bound = sqrt(6/100)
        let t = Init::KaimingUniform { a: 0.0 }
            .materialize((50, 100))
            .unwrap();
        let bound = (6.0f32 / 100.0).sqrt() + 1e-6;
        for v in t.to_vec_f32().unwrap() {
            assert!(v.abs() <= bound, "{v} outside ±{bound}");
        }
    }

    #[test]
    fn xavier_uniform_stays_in_bounds() {
        let t = Init::XavierUniform.materialize((30, 70)).unwrap();
        let bound = (6.0f32 / 100.0).sqrt() + 1e-6;
        for v in t.to_vec_f32().unwrap() {
            assert!(v.abs() <= bound);
        }
    }

    #[test]
    fn identity_init() {
        let t = Init::Identity.materialize((3, 3)).unwrap();
        assert_eq!(
            t.to_vec_f32().unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        );
        assert!(matches!(
            Init::Identity.materialize((3, 4)).unwrap_err(),
            Error::Unsupported(_)
        ));
    }

    #[test]
    fn fans_fold_receptive_field() {
        let (fan_in, fan_out) = compute_fans(&Shape::from((16, 3, 5, 5)));
        assert_eq!(fan_in, 75.0);
        assert_eq!(fan_out, 400.0);
    }

    #[test]
    fn placeholder_is_single_element() {
        let p = Parameter::placeholder().unwrap();
        assert_eq!(p.tensor().size(), 1);
        assert!(p.is_bias());
    }

    #[test]
    fn fresh_parameter_zero_grad_reads_zeros() {
        let p = Parameter::new(&Init::Ones, (4, 4), false, false).unwrap();
        p.zero_grad().unwrap();
        let g = p.tensor().grad().unwrap();
        assert_eq!(g.dims(), vec![4, 4]);
        assert_eq!(g.to_vec_f32().unwrap(), vec![0.0; 16]);
    }

    #[test]
    fn optimizer_stuff_allocates_once() {
        let p = Parameter::new(&Init::Zeros, (2, 3), false, false).unwrap();
        let a = p.optimizer_stuff(2).unwrap();
        let b = p.optimizer_stuff(2).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].id(), b[0].id());
        assert_eq!(a[0].dims(), vec![2, 3]);
    }
}
