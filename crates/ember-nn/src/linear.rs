use ember_core::kernel::{bias_add_cpu, bias_grad_cpu, gemm_cpu, BiasGradKernel, GemmKernel, GemmSpec};
use ember_core::{ComputeBackend, Error, Init, Parameter, Result, Session, Shape, Tensor};

use crate::module::{Module, ModuleCore};

// Linear — fully-connected layer: y = x·Wᵀ + b
//
//   weight: [out_features, in_features]
//   bias:   [out_features] (or the 1-element placeholder)
//   input:  [batch, in_features] → output: [batch, out_features]
//
// The device path is one GEMM handle per direction: forward (x·Wᵀ with
// fused bias), weight gradient (dyᵀ·x), input gradient (dy·W), plus the
// bias-gradient reduction. The CPU path runs the same three products
// through the reference GEMM.

pub struct Linear {
    core: ModuleCore,
    in_features: usize,
    out_features: usize,
    use_bias: bool,
    weight: Parameter,
    bias: Parameter,
    gemm_y: Option<GemmKernel>,
    gemm_dw: Option<GemmKernel>,
    gemm_dx: Option<GemmKernel>,
    bias_grad: Option<BiasGradKernel>,
}

impl Linear {
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
    ) -> Result<Self> {
        Self::with_init(
            session,
            backend,
            in_features,
            out_features,
            use_bias,
            Init::KaimingUniform { a: 5.0f32.sqrt() },
        )
    }

    /// Construct with an explicit weight initialization rule.
    pub fn with_init(
        session: &Session,
        backend: &ComputeBackend,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        weight_init: Init,
    ) -> Result<Self> {
        let core = ModuleCore::new(session, backend, "Linear");
        let weight = core.register_weight(&weight_init, (out_features, in_features))?;
        let bias = core.register_bias(use_bias, &Init::Zeros, (out_features,))?;
        let (gemm_y, gemm_dw, gemm_dx, bias_grad) = match backend.device() {
            Some(ctx) => (
                Some(GemmKernel::new(ctx, false, true, 1.0, 0.0)),
                Some(GemmKernel::new(ctx, true, false, 1.0, 0.0)),
                Some(GemmKernel::new(ctx, false, false, 1.0, 0.0)),
                Some(BiasGradKernel::new(ctx)),
            ),
            None => (None, None, None, None),
        };
        Ok(Linear {
            core,
            in_features,
            out_features,
            use_bias,
            weight,
            bias,
            gemm_y,
            gemm_dw,
            gemm_dx,
            bias_grad,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    fn check_input(&self, x: &Tensor) -> Result<usize> {
        let dims = x.dims();
        if dims.len() != 2 || dims[1] != self.in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![dims.first().copied().unwrap_or(1), self.in_features]),
                got: x.shape(),
            });
        }
        Ok(dims[0])
    }

    fn forward_cpu(&self, x: &Tensor, y: &Tensor, batch: usize) -> Result<()> {
        let xv = x.to_vec_f32()?;
        let wv = self.weight.tensor().to_vec_f32()?;
        let mut yv = vec![0.0f32; batch * self.out_features];
        gemm_cpu(
            false,
            true,
            batch,
            self.out_features,
            self.in_features,
            1.0,
            &xv,
            &wv,
            0.0,
            &mut yv,
        );
        if self.use_bias {
            let bv = self.bias.tensor().to_vec_f32()?;
            bias_add_cpu(&mut yv, &bv, 1);
        }
        y.set_host_f32(&yv)
    }

    fn forward_gpu(&mut self, x: &Tensor, y: &Tensor, batch: usize) -> Result<()> {
        let spec = GemmSpec {
            m: batch,
            n: self.out_features,
            k: self.in_features,
            batch: 1,
            a_step: 0,
            b_step: 0,
            y_step: 0,
            bias_len: if self.use_bias { self.out_features } else { 0 },
            bias_inner: 1,
        };
        let kernel = self
            .gemm_y
            .as_mut()
            .ok_or_else(|| Error::msg("device kernel missing"))?;
        kernel.stage(
            y,
            x,
            self.weight.tensor(),
            self.use_bias.then(|| self.bias.tensor()),
            spec,
        )?;
        kernel.run()
    }
}

impl Module for Linear {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let x = xs[0];
        let batch = self.check_input(x)?;
        let y = self.core.register_output((batch, self.out_features))?;
        let tickets = vec![
            self.core.stage_forward_arg("x", x),
            self.core.stage_backward_arg("x", x),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[x], &y);
        match self.core.backend().clone() {
            ComputeBackend::Cpu => self.forward_cpu(x, &y, batch)?,
            ComputeBackend::Device(_) => self.forward_gpu(x, &y, batch)?,
        }
        Ok(y)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        let y = self.core.output()?;
        let batch = x.dims()[0];
        let (m_out, k_in) = (self.out_features, self.in_features);
        let dy = y.grad()?;
        let dx = x.grad()?;
        let dw = self.weight.tensor().grad()?;

        match self.core.backend().clone() {
            ComputeBackend::Cpu => {
                let dyv = dy.to_vec_f32()?;
                let xv = x.to_vec_f32()?;
                let wv = self.weight.tensor().to_vec_f32()?;

                // dW[out, in] = dyᵀ[out, batch] · x[batch, in]
                let mut dwv = vec![0.0f32; m_out * k_in];
                gemm_cpu(true, false, m_out, k_in, batch, 1.0, &dyv, &xv, 0.0, &mut dwv);
                dw.set_host_f32(&dwv)?;

                if self.use_bias {
                    let db = self.bias.tensor().grad()?;
                    let mut dbv = vec![0.0f32; m_out];
                    bias_grad_cpu(&mut dbv, &dyv, batch, 1);
                    db.set_host_f32(&dbv)?;
                }

                // dx[batch, in] = dy[batch, out] · W[out, in]
                let mut dxv = vec![0.0f32; batch * k_in];
                gemm_cpu(false, false, batch, k_in, m_out, 1.0, &dyv, &wv, 0.0, &mut dxv);
                dx.set_host_f32(&dxv)?;
            }
            ComputeBackend::Device(_) => {
                let kernel = self
                    .gemm_dw
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                kernel.stage(
                    &dw,
                    &dy,
                    &x,
                    None,
                    GemmSpec::single(m_out, k_in, batch),
                )?;
                kernel.run()?;

                if self.use_bias {
                    let db = self.bias.tensor().grad()?;
                    let reduce = self
                        .bias_grad
                        .as_mut()
                        .ok_or_else(|| Error::msg("device kernel missing"))?;
                    reduce.stage(&db, &dy, batch, m_out, 1)?;
                    reduce.run()?;
                }

                let kernel = self
                    .gemm_dx
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                kernel.stage(
                    &dx,
                    &dy,
                    self.weight.tensor(),
                    None,
                    GemmSpec::single(batch, k_in, m_out),
                )?;
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
    fn identity_weight_passes_input_through() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut layer =
            Linear::with_init(&session, &backend, 5, 5, true, Init::Identity).unwrap();
        let x = Tensor::ones((3, 5));
        let y = layer.call(&x).unwrap();
        assert_eq!(y.dims(), vec![3, 5]);
        for v in y.to_vec_f32().unwrap() {
            approx::assert_relative_eq!(v, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn rejects_wrong_feature_count() {
        let session = Session::with_workers(1);
        let mut layer = Linear::new(&session, &ComputeBackend::Cpu, 4, 2, false).unwrap();
        let x = Tensor::ones((3, 5));
        assert!(matches!(
            layer.call(&x).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn backward_produces_expected_gradients() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        // 1→1 layer, weight [[2]], no bias: y = 2x, dy/dw = x, dy/dx = 2.
        let mut layer =
            Linear::with_init(&session, &backend, 1, 1, false, Init::Constant(2.0)).unwrap();
        let x = Tensor::from_vec(vec![3.0], (1, 1)).unwrap();
        let y = layer.call(&x).unwrap();
        assert_eq!(y.to_vec_f32().unwrap(), vec![6.0]);

        y.grad().unwrap().set_host_f32(&[1.0]).unwrap();
        let dx = layer.backward().unwrap();
        assert_eq!(dx.to_vec_f32().unwrap(), vec![2.0]);
        let dw = layer.weight().tensor().grad().unwrap();
        assert_eq!(dw.to_vec_f32().unwrap(), vec![3.0]);
    }

    #[test]
    fn bias_gradient_sums_over_batch() {
        let session = Session::with_workers(2);
        let mut layer =
            Linear::with_init(&session, &ComputeBackend::Cpu, 2, 2, true, Init::Zeros).unwrap();
        let x = Tensor::ones((3, 2));
        let y = layer.call(&x).unwrap();
        y.grad().unwrap().set_host_f32(&[1.0; 6]).unwrap();
        layer.backward().unwrap();
        let db = layer.bias().tensor().grad().unwrap();
        assert_eq!(db.to_vec_f32().unwrap(), vec![3.0, 3.0]);
    }
}
