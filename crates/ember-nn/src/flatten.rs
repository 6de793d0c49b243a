use ember_core::{ComputeBackend, Error, Result, Session, Tensor};

use crate::module::{Module, ModuleCore};

/// Collapse everything after the batch axis: [batch, ...] → [batch, rest].
///
/// An in-place module: the input tensor itself is reshaped (its gradient
/// with it) and returned; backward restores the original shape.
pub struct Flatten {
    core: ModuleCore,
    old_dims: Vec<usize>,
}

impl Flatten {
    pub fn new(session: &Session, backend: &ComputeBackend) -> Self {
        Flatten {
            core: ModuleCore::new(session, backend, "Flatten"),
            old_dims: Vec::new(),
        }
    }
}

impl Module for Flatten {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let x = xs[0];
        let dims = x.dims();
        if dims.is_empty() {
            return Err(Error::msg("flatten needs at least one axis"));
        }
        self.old_dims = dims.clone();
        let rest: usize = dims[1..].iter().product();
        let tickets = vec![self.core.stage_backward_arg("x", x)];
        self.core.join(tickets)?;
        self.core.record_step(&[x], x);
        x.reshape((dims[0], rest))?;
        Ok(x.clone())
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        x.reshape(self.old_dims.clone())?;
        x.grad()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_and_restores() {
        let session = Session::with_workers(1);
        let mut flat = Flatten::new(&session, &ComputeBackend::Cpu);
        let x = Tensor::zeros((2, 3, 4, 4));
        let y = flat.call(&x).unwrap();
        assert_eq!(y.dims(), vec![2, 48]);
        flat.backward().unwrap();
        assert_eq!(x.dims(), vec![2, 3, 4, 4]);
    }
}
