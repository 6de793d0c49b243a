use ember_core::{ComputeBackend, Error, Parameter, Result, Session, Tensor};

use crate::module::{Module, ModuleCore};

/// An ordered chain of layers.
///
/// Forward threads one tensor through every layer in order; backward
/// walks the layers in reverse — the recorded execution order of the
/// session graph read backwards — and returns the gradient with respect
/// to the chain's input.
pub struct Sequential {
    core: ModuleCore,
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(session: &Session, backend: &ComputeBackend) -> Self {
        Sequential {
            core: ModuleCore::new(session, backend, "Sequential"),
            layers: Vec::new(),
        }
    }

    /// Append a layer; builder-style.
    pub fn push(mut self, layer: impl Module + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        if self.layers.is_empty() {
            return Err(Error::msg("empty Sequential"));
        }
        let mut current = xs[0].clone();
        for layer in self.layers.iter_mut() {
            current = layer.forward(&[&current])?;
        }
        Ok(current)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let mut grad = None;
        for layer in self.layers.iter_mut().rev() {
            grad = Some(layer.backward()?);
        }
        grad.ok_or_else(|| Error::msg("empty Sequential"))
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = self.core.parameters();
        for layer in &self.layers {
            params.extend(layer.parameters());
        }
        params
    }

    fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::linear::Linear;
    use ember_core::Init;

    #[test]
    fn chains_forward_and_reverses_backward() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut model = Sequential::new(&session, &backend)
            .push(Linear::with_init(&session, &backend, 2, 2, false, Init::Identity).unwrap())
            .push(Activation::relu(&session, &backend))
            .push(Linear::with_init(&session, &backend, 2, 1, false, Init::Constant(1.0)).unwrap());

        let x = Tensor::from_vec(vec![1.0, -2.0], (1, 2)).unwrap();
        let y = model.call(&x).unwrap();
        // identity → relu([1, -2]) = [1, 0] → sum = 1
        assert_eq!(y.to_vec_f32().unwrap(), vec![1.0]);

        y.grad().unwrap().set_host_f32(&[1.0]).unwrap();
        let dx = model.backward().unwrap();
        // Gradient flows through the positive lane only.
        assert_eq!(dx.to_vec_f32().unwrap(), vec![1.0, 0.0]);

        // Execution order was recorded for the whole chain.
        let order = session.execution_order();
        assert_eq!(order.len(), 3);
        assert!(order[0].module.starts_with("Linear"));
        assert!(order[1].module.starts_with("ReLU"));
    }

    #[test]
    fn collects_parameters_from_children() {
        let session = Session::with_workers(1);
        let backend = ComputeBackend::Cpu;
        let model = Sequential::new(&session, &backend)
            .push(Linear::new(&session, &backend, 4, 3, true).unwrap())
            .push(Linear::new(&session, &backend, 3, 2, false).unwrap());
        // weight + bias, weight + placeholder-bias
        assert_eq!(model.parameters().len(), 4);
    }
}
