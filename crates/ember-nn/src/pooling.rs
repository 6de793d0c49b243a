use ember_core::kernel::{
    col_max_cpu, col_max_scatter_cpu, ColMaxKernel, ColMaxScatterKernel, LoweringDir,
    LoweringKernel,
};
use ember_core::{
    dim_fix, ComputeBackend, Error, Lowering, Result, Session, Shape, Tensor, MAX_DIMS,
};

use crate::module::{Module, ModuleCore};

// MaxPoolNd — max pooling through the same lowering as convolution
//
// The input is lowered with channels = input channels, so the column
// matrix rows group as [channel][kernel tap]. Pooling is then a max over
// the taps of each (batch, channel, output cell); the winning tap index
// is cached so the backward pass can scatter the output gradient to
// exactly the cell that produced the max, then col2vol it back into
// input space.

pub struct MaxPoolNd {
    core: ModuleCore,
    dims: usize,
    kernel_size: [usize; MAX_DIMS],
    stride: [usize; MAX_DIMS],
    padding: [usize; MAX_DIMS],
    dilation: [usize; MAX_DIMS],
    channels: usize,
    lowering: Option<Lowering>,
    col: Option<Tensor>,
    argmax: Option<Tensor>,
    output_spatial: Vec<usize>,
    lower_fwd: Option<LoweringKernel>,
    lower_bwd: Option<LoweringKernel>,
    col_max: Option<ColMaxKernel>,
    col_scatter: Option<ColMaxScatterKernel>,
}

impl MaxPoolNd {
    pub fn new(
        session: &Session,
        backend: &ComputeBackend,
        dims: usize,
        kernel_size: &[usize],
        stride: &[usize],
        padding: &[usize],
        dilation: &[usize],
    ) -> Result<Self> {
        if dims == 0 || dims > MAX_DIMS {
            return Err(Error::Unsupported(format!("{dims}-dimensional pooling")));
        }
        let type_name = format!("MaxPool{dims}d");
        Ok(MaxPoolNd {
            core: ModuleCore::new(session, backend, &type_name),
            dims,
            kernel_size: dim_fix(1, kernel_size, dims),
            stride: dim_fix(1, stride, dims),
            padding: dim_fix(0, padding, dims),
            dilation: dim_fix(1, dilation, dims),
            channels: 0,
            lowering: None,
            col: None,
            argmax: None,
            output_spatial: Vec::new(),
            lower_fwd: None,
            lower_bwd: None,
            col_max: None,
            col_scatter: None,
        })
    }

    pub fn max_pool1d(
        session: &Session,
        backend: &ComputeBackend,
        kernel_size: usize,
        stride: usize,
    ) -> Result<Self> {
        Self::new(session, backend, 1, &[kernel_size], &[stride], &[0], &[1])
    }

    pub fn max_pool2d(
        session: &Session,
        backend: &ComputeBackend,
        kernel_size: [usize; 2],
        stride: [usize; 2],
    ) -> Result<Self> {
        Self::new(session, backend, 2, &kernel_size, &stride, &[0, 0], &[1, 1])
    }

    pub fn max_pool3d(
        session: &Session,
        backend: &ComputeBackend,
        kernel_size: [usize; 3],
        stride: [usize; 3],
    ) -> Result<Self> {
        Self::new(
            session,
            backend,
            3,
            &kernel_size,
            &stride,
            &[0, 0, 0],
            &[1, 1, 1],
        )
    }

    fn ensure_lowering(&mut self, x: &Tensor) -> Result<Lowering> {
        if let Some(l) = &self.lowering {
            return Ok(l.clone());
        }
        let dims = x.dims();
        if dims.len() != 2 + self.dims {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![0; 2 + self.dims]),
                got: x.shape(),
            });
        }
        let batch = dims[0];
        self.channels = dims[1];
        let vol = dim_fix(1, &dims[2..], self.dims);
        let lowering = Lowering::new(
            batch,
            self.channels,
            vol,
            self.kernel_size,
            self.stride,
            self.padding,
            self.dilation,
        )?;
        self.output_spatial = lowering.col[MAX_DIMS - self.dims..].to_vec();
        self.col = Some(Tensor::zeros((lowering.rows(), batch * lowering.cells())));
        self.argmax = Some(Tensor::zeros_i32((
            batch,
            self.channels,
            lowering.cells(),
        )));
        if let Some(ctx) = self.core.backend().device() {
            self.lower_fwd = Some(LoweringKernel::new(ctx, LoweringDir::Gather, lowering.clone()));
            self.lower_bwd = Some(LoweringKernel::new(
                ctx,
                LoweringDir::Scatter,
                lowering.clone(),
            ));
            self.col_max = Some(ColMaxKernel::new(ctx));
            self.col_scatter = Some(ColMaxScatterKernel::new(ctx));
        }
        self.lowering = Some(lowering.clone());
        Ok(lowering)
    }

    fn cached(&self) -> Result<(Tensor, Tensor)> {
        match (&self.col, &self.argmax) {
            (Some(c), Some(a)) => Ok((c.clone(), a.clone())),
            _ => Err(Error::msg("pooling lowering not initialized")),
        }
    }
}

impl Module for MaxPoolNd {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor> {
        let x = xs[0];
        let lo = self.ensure_lowering(x)?;
        let mut y_dims = vec![lo.batch, self.channels];
        y_dims.extend_from_slice(&self.output_spatial);
        let y = self.core.register_output(y_dims)?;
        let tickets = vec![
            self.core.stage_forward_arg("x", x),
            self.core.stage_backward_arg("x", x),
        ];
        self.core.join(tickets)?;
        self.core.record_step(&[x], &y);

        let (col, argmax) = self.cached()?;
        let kvol = lo.kernel_volume();
        let cells = lo.cells();
        match self.core.backend().clone() {
            ComputeBackend::Cpu => {
                let xv = x.to_vec_f32()?;
                let mut colv = vec![0.0f32; lo.col_len()];
                lo.vol2col(&xv, &mut colv)?;
                let mut yv = vec![0.0f32; lo.batch * self.channels * cells];
                let mut idxv = vec![0i32; yv.len()];
                col_max_cpu(&colv, &mut yv, &mut idxv, self.channels, kvol, cells);
                col.set_host_f32(&colv)?;
                argmax.set_host_i32(&idxv)?;
                y.set_host_f32(&yv)?;
            }
            ComputeBackend::Device(_) => {
                let lower = self
                    .lower_fwd
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                lower.stage(&col, x)?;
                lower.run()?;
                let reduce = self
                    .col_max
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                reduce.stage(&y, &argmax, &col, self.channels, kvol, cells)?;
                reduce.run()?;
            }
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
        let (col, argmax) = self.cached()?;
        let kvol = lo.kernel_volume();
        let cells = lo.cells();

        let dy = y.grad()?;
        let dx = x.grad()?;
        let dcol = col.grad()?;

        match self.core.backend().clone() {
            ComputeBackend::Cpu => {
                let dyv = dy.to_vec_f32()?;
                let idxv = argmax.to_vec_i32()?;
                let mut dcolv = vec![0.0f32; lo.col_len()];
                col_max_scatter_cpu(&mut dcolv, &idxv, &dyv, self.channels, kvol, cells);
                dcol.set_host_f32(&dcolv)?;
                let mut dxv = vec![0.0f32; lo.batch * lo.vol_len()];
                lo.col2vol(&dcolv, &mut dxv)?;
                dx.set_host_f32(&dxv)?;
            }
            ComputeBackend::Device(_) => {
                let scatter = self
                    .col_scatter
                    .as_mut()
                    .ok_or_else(|| Error::msg("device kernel missing"))?;
                scatter.stage(&dcol, &argmax, &dy, self.channels, kvol, cells)?;
                scatter.run()?;
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
    fn max_pool2d_picks_window_maxima() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut pool = MaxPoolNd::max_pool2d(&session, &backend, [2, 2], [1, 1]).unwrap();
        let x = Tensor::from_vec((0..100).map(|i| i as f32).collect(), (2, 2, 5, 5)).unwrap();
        let y = pool.call(&x).unwrap();
        assert_eq!(y.dims(), vec![2, 2, 4, 4]);
        let yv = y.to_vec_f32().unwrap();
        // In a row-major ramp, every 2×2 window's max is its bottom-right
        // corner: base + (i+1)*5 + (j+1).
        for (block, base) in [(0usize, 0.0f32), (1, 25.0), (2, 50.0), (3, 75.0)] {
            for i in 0..4 {
                for j in 0..4 {
                    let got = yv[block * 16 + i * 4 + j];
                    let expect = base + ((i + 1) * 5 + (j + 1)) as f32;
                    assert_eq!(got, expect);
                }
            }
        }
    }

    #[test]
    fn backward_routes_gradient_to_maxima() {
        let session = Session::with_workers(2);
        let backend = ComputeBackend::Cpu;
        let mut pool = MaxPoolNd::max_pool2d(&session, &backend, [2, 2], [2, 2]).unwrap();
        let x = Tensor::from_vec((0..16).map(|i| i as f32).collect(), (1, 1, 4, 4)).unwrap();
        let y = pool.call(&x).unwrap();
        assert_eq!(y.dims(), vec![1, 1, 2, 2]);
        assert_eq!(y.to_vec_f32().unwrap(), vec![5.0, 7.0, 13.0, 15.0]);

        y.grad()
            .unwrap()
            .set_host_f32(&[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let dx = pool.backward().unwrap();
        let dxv = dx.to_vec_f32().unwrap();
        let mut expected = vec![0.0f32; 16];
        expected[5] = 1.0;
        expected[7] = 2.0;
        expected[13] = 3.0;
        expected[15] = 4.0;
        assert_eq!(dxv, expected);
    }
}
