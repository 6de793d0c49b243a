use ember_core::kernel::{MapGradKernel, MapKernel, MapOp};
use ember_core::{ComputeBackend, Result, Session, Tensor};

use crate::module::{Module, ModuleCore};

// Elementwise activations. One struct, three constructors: the layers
// differ only in which map the kernel handle runs and which tensor the
// derivative is expressed through (the input for ReLU, the output for
// sigmoid and tanh).

pub struct Activation {
    core: ModuleCore,
    op: MapOp,
    forward_kernel: Option<MapKernel>,
    backward_kernel: Option<MapGradKernel>,
}

impl Activation {
    fn new(session: &Session, backend: &ComputeBackend, op: MapOp, type_name: &str) -> Self {
        let core = ModuleCore::new(session, backend, type_name);
        let (forward_kernel, backward_kernel) = match backend.device() {
            Some(ctx) => (
                Some(MapKernel::new(ctx, op)),
                Some(MapGradKernel::new(ctx, op)),
            ),
            None => (None, None),
        };
        Activation {
            core,
            op,
            forward_kernel,
            backward_kernel,
        }
    }

    pub fn relu(session: &Session, backend: &ComputeBackend) -> Self {
        Self::new(session, backend, MapOp::Relu, "ReLU")
    }

    pub fn sigmoid(session: &Session, backend: &ComputeBackend) -> Self {
        Self::new(session, backend, MapOp::Sigmoid, "Sigmoid")
    }

    pub fn tanh(session: &Session, backend: &ComputeBackend) -> Self {
        Self::new(session, backend, MapOp::Tanh, "Tanh")
    }

    fn forward_cpu(&self, x: &Tensor, y: &Tensor) -> Result<()> {
        let op = self.op;
        let xv = x.to_vec_f32()?;
        y.with_host_f32_mut(|out| {
            for (o, &v) in out.iter_mut().zip(xv.iter()) {
                *o = op.apply(v);
            }
        })
    }

    fn forward_gpu(&mut self, x: &Tensor, y: &Tensor) -> Result<()> {
        let kernel = self
            .forward_kernel
            .as_mut()
            .ok_or_else(|| ember_core::Error::msg("device kernel missing"))?;
        kernel.stage(y, x)?;
        kernel.run()
    }
}

impl Module for Activation {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let x = xs[0];
        let y = self.core.register_output(x.shape())?;
        let tickets = vec![
            self.core.stage_forward_arg("x", x),
            self.core.stage_backward_arg("x", x),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[x], &y);
        match self.core.backend().clone() {
            ComputeBackend::Cpu => self.forward_cpu(x, &y)?,
            ComputeBackend::Device(_) => self.forward_gpu(x, &y)?,
        }
        Ok(y)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        let y = self.core.output()?;
        let dy = y.grad()?;
        let dx = x.grad()?;
        // ReLU differentiates through the input, the others through the output.
        let reference = match self.op {
            MapOp::Relu => x.clone(),
            MapOp::Sigmoid | MapOp::Tanh => y.clone(),
        };
        match self.core.backend().clone() {
            ComputeBackend::Cpu => {
                let op = self.op;
                let refv = reference.to_vec_f32()?;
                let dyv = dy.to_vec_f32()?;
                dx.with_host_f32_mut(|out| {
                    for (i, o) in out.iter_mut().enumerate() {
                        *o = op.grad(refv[i], dyv[i]);
                    }
                })?;
            }
            ComputeBackend::Device(_) => {
                let kernel = self
                    .backward_kernel
                    .as_mut()
                    .ok_or_else(|| ember_core::Error::msg("device kernel missing"))?;
                kernel.stage(&dx, &reference, &dy)?;
                kernel.run()?;
            }
        }
        y.zero_grad()?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_forward_and_backward() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut relu = Activation::relu(&session, &backend);
        let x = Tensor::from_vec(vec![-1.0, 0.5, 2.0, -3.0], (2, 2)).unwrap();
        let y = relu.call(&x).unwrap();
        assert_eq!(y.to_vec_f32().unwrap(), vec![0.0, 0.5, 2.0, 0.0]);

        y.grad().unwrap().set_host_f32(&[1.0, 1.0, 1.0, 1.0]).unwrap();
        let dx = relu.backward().unwrap();
        assert_eq!(dx.to_vec_f32().unwrap(), vec![0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn sigmoid_forward_matches_formula() {
        let session = Session::with_workers(1);
        let mut sig = Activation::sigmoid(&session, &ComputeBackend::Cpu);
        let x = Tensor::from_vec(vec![0.0, 1.0], (1, 2)).unwrap();
        let y = sig.call(&x).unwrap();
        let got = y.to_vec_f32().unwrap();
        assert!((got[0] - 0.5).abs() < 1e-6);
        assert!((got[1] - 1.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-6);
    }
}
