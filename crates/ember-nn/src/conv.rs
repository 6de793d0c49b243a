use ember_core::kernel::{
    bias_add_cpu, bias_grad_cpu, gemm_cpu, BiasGradKernel, GemmKernel, GemmSpec, LoweringDir,
    LoweringKernel,
};
use ember_core::{
    dim_fix, ComputeBackend, Error, Init, Lowering, Parameter, Result, Session, Shape, Tensor,
    MAX_DIMS,
};

use crate::module::{Module, ModuleCore};

// ConvNd — N-dimensional convolution by lowering
//
// Kernel/stride/padding/dilation are normalized onto three spatial axes
// (leading axes extent 1), so one implementation serves Conv1d/2d/3d.
//
// The forward path is: vol2col the input into the column matrix, then
// one GEMM per batch element against the flattened weight
// [out_channels, in_channels * kernel_volume], writing the output block
// [out_channels, cells] directly. The backward path runs the two
// transposed GEMMs (weight gradient accumulated across the batch, column
// gradient per batch element) and scatters the column gradient back into
// input space with col2vol.
//
// The input spatial extents are read from the first input seen; the
// lowering configuration and the column tensor are cached from then on.

#[derive(Debug)]
pub struct ConvNd {
    core: ModuleCore,
    dims: usize,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; MAX_DIMS],
    stride: [usize; MAX_DIMS],
    padding: [usize; MAX_DIMS],
    dilation: [usize; MAX_DIMS],
    use_bias: bool,
    weight: Parameter,
    bias: Parameter,
    lowering: Option<Lowering>,
    col: Option<Tensor>,
    output_spatial: Vec<usize>,
    lower_fwd: Option<LoweringKernel>,
    lower_bwd: Option<LoweringKernel>,
    gemm_y: Option<GemmKernel>,
    gemm_dw: Option<GemmKernel>,
    gemm_dcol: Option<GemmKernel>,
    bias_grad: Option<BiasGradKernel>,
}

impl ConvNd {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        dims: usize,
        in_channels: usize,
        out_channels: usize,
        kernel_size: &[usize],
        stride: &[usize],
        padding: &[usize],
        dilation: &[usize],
        groups: usize,
        use_bias: bool,
        padding_mode: &str,
        weight_init: Init,
    ) -> Result<Self> {
        // Configuration the framework cannot honor is rejected here,
        // never deferred to forward.
        if groups != 1 {
            return Err(Error::Unsupported(
                "grouped convolution (groups != 1)".to_string(),
            ));
        }
        if in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(Error::Unsupported(
                "channel counts must be divisible by groups".to_string(),
            ));
        }
        if padding_mode != "zeros" {
            return Err(Error::Unsupported(format!(
                "padding mode '{padding_mode}' (only 'zeros')"
            )));
        }
        if dims == 0 || dims > MAX_DIMS {
            return Err(Error::Unsupported(format!(
                "{dims}-dimensional convolution"
            )));
        }

        let kernel_size = dim_fix(1, kernel_size, dims);
        let stride = dim_fix(1, stride, dims);
        let padding = dim_fix(0, padding, dims);
        let dilation = dim_fix(1, dilation, dims);

        let type_name = format!("Conv{dims}d");
        let core = ModuleCore::new(session, backend, &type_name);
        let mut weight_shape = vec![out_channels, in_channels];
        weight_shape.extend_from_slice(&kernel_size);
        let weight = core.register_weight(&weight_init, weight_shape)?;
        let bias = core.register_bias(use_bias, &Init::Zeros, (out_channels,))?;

        Ok(ConvNd {
            core,
            dims,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            dilation,
            use_bias,
            weight,
            bias,
            lowering: None,
            col: None,
            output_spatial: Vec::new(),
            lower_fwd: None,
            lower_bwd: None,
            gemm_y: None,
            gemm_dw: None,
            gemm_dcol: None,
            bias_grad: None,
        })
    }

    /// 1-D convolution over [batch, channels, length].
    #[allow(clippy::too_many_arguments)]
    pub fn conv1d(
        session: &Session,
        backend: &ComputeBackend,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        use_bias: bool,
    ) -> Result<Self> {
        Self::new(
            session,
            backend,
            1,
            in_channels,
            out_channels,
            &[kernel_size],
            &[stride],
            &[padding],
            &[dilation],
            1,
            use_bias,
            "zeros",
            Init::KaimingUniform { a: 5.0f32.sqrt() },
        )
    }

    /// 2-D convolution over [batch, channels, height, width].
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        session: &Session,
        backend: &ComputeBackend,
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
        use_bias: bool,
    ) -> Result<Self> {
        Self::new(
            session,
            backend,
            2,
            in_channels,
            out_channels,
            &kernel_size,
            &stride,
            &padding,
            &dilation,
            1,
            use_bias,
            "zeros",
            Init::XavierUniform,
        )
    }

    /// 3-D convolution over [batch, channels, depth, height, width].
    #[allow(clippy::too_many_arguments)]
    pub fn conv3d(
        session: &Session,
        backend: &ComputeBackend,
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 3],
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
        use_bias: bool,
    ) -> Result<Self> {
        Self::new(
            session,
            backend,
            3,
            in_channels,
            out_channels,
            &kernel_size,
            &stride,
            &padding,
            &dilation,
            1,
            use_bias,
            "zeros",
            Init::KaimingUniform { a: 5.0f32.sqrt() },
        )
    }

    /// Override the weight initialization (e.g. `Init::Ones` in the
    /// parity self-tests).
    #[allow(clippy::too_many_arguments)]
    pub fn with_weight_init(
        session: &Session,
        backend: &ComputeBackend,
        dims: usize,
        in_channels: usize,
        out_channels: usize,
        kernel_size: &[usize],
        stride: &[usize],
        padding: &[usize],
        dilation: &[usize],
        use_bias: bool,
        weight_init: Init,
    ) -> Result<Self> {
        Self::new(
            session,
            backend,
            dims,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            dilation,
            1,
            use_bias,
            "zeros",
            weight_init,
        )
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    /// Derive the lowering configuration from the first input seen, cache
    /// the column tensor, and (on the device backend) build the kernel
    /// handles that depend on the geometry.
    fn ensure_lowering(&mut self, x: &Tensor) -> Result<Lowering> {
        if let Some(l) = &self.lowering {
            return Ok(l.clone());
        }
        let dims = x.dims();
        if dims.len() != 2 + self.dims || dims[1] != self.in_channels {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![dims.first().copied().unwrap_or(1), self.in_channels]),
                got: x.shape(),
            });
        }
        let batch = dims[0];
        let vol = dim_fix(1, &dims[2..], self.dims);
        let lowering = Lowering::new(
            batch,
            self.in_channels,
            vol,
            self.kernel_size,
            self.stride,
            self.padding,
            self.dilation,
        )?;
        self.output_spatial = lowering.col[MAX_DIMS - self.dims..].to_vec();
        // Column matrix: [rows, batch * cells] (batch-major blocks).
        let col = Tensor::zeros((lowering.rows(), batch * lowering.cells()));
        if let Some(ctx) = self.core.backend().device() {
            self.lower_fwd = Some(LoweringKernel::new(ctx, LoweringDir::Gather, lowering.clone()));
            self.lower_bwd = Some(LoweringKernel::new(
                ctx,
                LoweringDir::Scatter,
                lowering.clone(),
            ));
            self.gemm_y = Some(GemmKernel::new(ctx, false, false, 1.0, 0.0));
            self.gemm_dw = Some(GemmKernel::new(ctx, false, true, 1.0, 1.0));
            self.gemm_dcol = Some(GemmKernel::new(ctx, true, false, 1.0, 0.0));
            self.bias_grad = Some(BiasGradKernel::new(ctx));
        }
        self.col = Some(col);
        self.lowering = Some(lowering.clone());
        Ok(lowering)
    }

    fn col_tensor(&self) -> Result<Tensor> {
        self.col
            .clone()
            .ok_or_else(|| Error::msg("convolution lowering not initialized"))
    }

    fn forward_cpu(&self, lo: &Lowering, x: &Tensor, y: &Tensor) -> Result<()> {
        let col = self.col_tensor()?;
        let xv = x.to_vec_f32()?;
        let mut colv = vec![0.0f32; lo.col_len()];
        lo.vol2col(&xv, &mut colv)?;

        let (rows, cells) = (lo.rows(), lo.cells());
        let wv = self.weight.tensor().to_vec_f32()?;
        let mut yv = vec![0.0f32; lo.batch * self.out_channels * cells];
        for b in 0..lo.batch {
            gemm_cpu(
                false,
                false,
                self.out_channels,
                cells,
                rows,
                1.0,
                &wv,
                &colv[b * rows * cells..(b + 1) * rows * cells],
                0.0,
                &mut yv[b * self.out_channels * cells..(b + 1) * self.out_channels * cells],
            );
        }
        if self.use_bias {
            let bv = self.bias.tensor().to_vec_f32()?;
            bias_add_cpu(&mut yv, &bv, cells);
        }
        col.set_host_f32(&colv)?;
        y.set_host_f32(&yv)
    }

    fn forward_gpu(&mut self, lo: &Lowering, x: &Tensor, y: &Tensor) -> Result<()> {
        let col = self.col_tensor()?;
        let lower = self
            .lower_fwd
            .as_mut()
            .ok_or_else(|| Error::msg("device kernel missing"))?;
        lower.stage(&col, x)?;
        lower.run()?;

        let (rows, cells) = (lo.rows(), lo.cells());
        let spec = GemmSpec {
            m: self.out_channels,
            n: cells,
            k: rows,
            batch: lo.batch,
            a_step: 0,
            b_step: rows * cells,
            y_step: self.out_channels * cells,
            bias_len: if self.use_bias { self.out_channels } else { 0 },
            bias_inner: cells,
        };
        let gemm = self
            .gemm_y
            .as_mut()
            .ok_or_else(|| Error::msg("device kernel missing"))?;
        gemm.stage(
            y,
            self.weight.tensor(),
            &col,
            self.use_bias.then(|| self.bias.tensor()),
            spec,
        )?;
        gemm.run()
    }
}

impl Module for ConvNd {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let x = xs[0];
        let lo = self.ensure_lowering(x)?;
        let mut y_dims = vec![lo.batch, self.out_channels];
        y_dims.extend_from_slice(&self.output_spatial);
        let y = self.core.register_output(y_dims)?;
        let tickets = vec![
            self.core.stage_forward_arg("x", x),
            self.core.stage_backward_arg("x", x),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[x], &y);
        match self.core.backend().clone() {
            ComputeBackend::Cpu => self.forward_cpu(&lo, x, &y)?,
            ComputeBackend::Device(_) => self.forward_gpu(&lo, x, &y)?,
        }
        Ok(y)
    }

    fn backward(&mut self) -> Result<Tensor> {
        let x = self.core.backward_arg("x")?;
        let y = self.core.output()?;
        let lo = self
            .lowering
            .clone()
            .ok_or_else(|| Error::msg("backward before forward"))?;
        let col = self.col_tensor()?;
        let (rows, cells) = (lo.rows(), lo.cells());
        let out = self.out_channels;

        let dy = y.grad()?;
        let dx = x.grad()?;
        let dw = self.weight.tensor().grad()?;
        let dcol = col.grad()?;

        match self.core.backend().clone() {
            ComputeBackend::Cpu => {
                let dyv = dy.to_vec_f32()?;
                let colv = col.to_vec_f32()?;
                let wv = self.weight.tensor().to_vec_f32()?;

                // dW[out, rows] accumulates dy_b · col_bᵀ over the batch.
                let mut dwv = vec![0.0f32; out * rows];
                for b in 0..lo.batch {
                    gemm_cpu(
                        false,
                        true,
                        out,
                        rows,
                        cells,
                        1.0,
                        &dyv[b * out * cells..(b + 1) * out * cells],
                        &colv[b * rows * cells..(b + 1) * rows * cells],
                        1.0,
                        &mut dwv,
                    );
                }
                dw.set_host_f32(&dwv)?;

                if self.use_bias {
                    let db = self.bias.tensor().grad()?;
                    let mut dbv = vec![0.0f32; out];
                    bias_grad_cpu(&mut dbv, &dyv, lo.batch, cells);
                    db.set_host_f32(&dbv)?;
                }

                // dcol_b = Wᵀ · dy_b, then scatter-accumulate into dx.
                let mut dcolv = vec![0.0f32; lo.col_len()];
                for b in 0..lo.batch {
                    gemm_cpu(
                        true,
                        false,
                        rows,
                        cells,
                        out,
                        1.0,
                        &wv,
                        &dyv[b * out * cells..(b + 1) * out * cells],
                        0.0,
                        &mut dcolv[b * rows * cells..(b + 1) * rows * cells],
                    );
                }
                dcol.set_host_f32(&dcolv)?;

                let mut dxv = vec![0.0f32; lo.batch * lo.vol_len()];
                lo.col2vol(&dcolv, &mut dxv)?;
                dx.set_host_f32(&dxv)?;
            }
            ComputeBackend::Device(_) => {
                // The weight-gradient GEMM accumulates (beta = 1) across
                // the batch loop, so its destination starts from zero.
                dw.fill(0.0)?;
                let gemm = self
                    .gemm_dw
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                gemm.stage(
                    &dw,
                    &dy,
                    &col,
                    None,
                    GemmSpec {
                        m: out,
                        n: rows,
                        k: cells,
                        batch: lo.batch,
                        a_step: out * cells,
                        b_step: rows * cells,
                        y_step: 0,
                        bias_len: 0,
                        bias_inner: 1,
                    },
                )?;
                gemm.run()?;

                if self.use_bias {
                    let db = self.bias.tensor().grad()?;
                    let reduce = self
                        .bias_grad
                        .as_mut()
                        .ok_or_else(|| Error::msg("device kernel missing"))?;
                    reduce.stage(&db, &dy, lo.batch, out, cells)?;
                    reduce.run()?;
                }

                let gemm = self
                    .gemm_dcol
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                gemm.stage(
                    &dcol,
                    self.weight.tensor(),
                    &dy,
                    None,
                    GemmSpec {
                        m: rows,
                        n: cells,
                        k: out,
                        batch: lo.batch,
                        a_step: 0,
                        b_step: out * cells,
                        y_step: rows * cells,
                        bias_len: 0,
                        bias_inner: 1,
                    },
                )?;
                gemm.run()?;

                dx.fill(0.0)?;
                let lower = self
                    .lower_bwd
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                lower.stage(&dx, &dcol)?;
                lower.run()?;
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
    fn rejects_unsupported_configuration_at_construction() {
        let session = Session::with_workers(1);
        let b = ComputeBackend::Cpu;
        let err = ConvNd::new(
            &session, &b, 2, 4, 8, &[3, 3], &[1, 1], &[1, 1], &[1, 1], 2, false, "zeros",
            Init::XavierUniform,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let err = ConvNd::new(
            &session, &b, 2, 4, 8, &[3, 3], &[1, 1], &[1, 1], &[1, 1], 1, false, "reflect",
            Init::XavierUniform,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn ones_kernel_reproduces_padded_convolution_table() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut conv = ConvNd::with_weight_init(
            &session,
            &backend,
            2,
            1,
            1,
            &[3, 3],
            &[1, 1],
            &[1, 1],
            &[1, 1],
            false,
            Init::Ones,
        )
        .unwrap();
        let x = Tensor::from_vec((0..25).map(|i| i as f32).collect(), (1, 1, 5, 5)).unwrap();
        let y = conv.call(&x).unwrap();
        assert_eq!(y.dims(), vec![1, 1, 5, 5]);
        let expected = [
            12.0, 21.0, 27.0, 33.0, 24.0, //
            33.0, 54.0, 63.0, 72.0, 51.0, //
            63.0, 99.0, 108.0, 117.0, 81.0, //
            93.0, 144.0, 153.0, 162.0, 111.0, //
            72.0, 111.0, 117.0, 123.0, 84.0,
        ];
        let got = y.to_vec_f32().unwrap();
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-4, "{g} != {e}");
        }
    }

    #[test]
    fn backward_distributes_gradient_through_overlaps() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut conv = ConvNd::with_weight_init(
            &session,
            &backend,
            2,
            1,
            1,
            &[3, 3],
            &[1, 1],
            &[1, 1],
            &[1, 1],
            false,
            Init::Ones,
        )
        .unwrap();
        let x = Tensor::ones((1, 1, 5, 5));
        let y = conv.call(&x).unwrap();
        y.grad().unwrap().set_host_f32(&[1.0; 25]).unwrap();
        let dx = conv.backward().unwrap();
        let dxv = dx.to_vec_f32().unwrap();
        // With an all-ones weight and unit output gradient, the input
        // gradient at each cell is the number of receptive fields
        // containing it: 9 interior, 4 corners.
        assert_eq!(dxv[12], 9.0);
        assert_eq!(dxv[0], 4.0);
        // Weight gradient: each tap sums the input cells it touched.
        let dw = conv.weight().tensor().grad().unwrap().to_vec_f32().unwrap();
        // Center tap sees all 25 ones.
        assert_eq!(dw[4], 25.0);
        // Corner tap (offset (-1,-1)) misses the first row and column: 16.
        assert_eq!(dw[0], 16.0);
    }

    #[test]
    fn conv1d_shares_the_lowering() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut conv =
            ConvNd::conv1d(&session, &backend, 1, 1, 3, 1, 1, 1, false).unwrap();
        // Deterministic weight for the check.
        conv.weight().tensor().set_host_f32(&[1.0, 1.0, 1.0]).unwrap();
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (1, 1, 4)).unwrap();
        let y = conv.call(&x).unwrap();
        assert_eq!(y.dims(), vec![1, 1, 4]);
        // Moving sum with zero padding: [0+1+2, 1+2+3, 2+3+4, 3+4+0]
        assert_eq!(y.to_vec_f32().unwrap(), vec![3.0, 6.0, 9.0, 7.0]);
    }
}
