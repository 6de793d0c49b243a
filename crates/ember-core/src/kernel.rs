use cudarc::cublas::sys::cublasOperation_t;
use cudarc::driver::{CudaSlice, DevicePtr, LaunchAsync};
use rayon::prelude::*;

use crate::bail;
use crate::device::{launch_cfg, DeviceContext};
use crate::error::{Error, Result};
use crate::lowering::Lowering;
use crate::tensor::Tensor;

// Kernel handles — the dispatch layer between layers and the device
//
// Every device-resident operation is an opaque handle with a two-phase
// contract: `stage(..)` binds tensor arguments (device buffers are
// allocated and synchronized, nothing is computed), `run()` submits the
// work and marks the written tensors device-authoritative. `run()`
// without a prior `stage()` is an error.
//
// The CPU path has no run phase: the equivalent computation executes
// synchronously inside the layer's CPU branch, using the `*_cpu`
// reference functions that sit next to each handle here. A new kernel
// type is not trusted until its device output matches its CPU reference
// on the same inputs (see the parity suite in tests/device_tests.rs).
//
// Optimizer step kernels are the one exception to "stage joins the
// tensor's pending handle": they run *as* the parameter's pending
// operation, so their stage uses the non-joining preparation.

//  GEMM

/// Per-call geometry of a (possibly batched) GEMM.
///
/// Each of the `batch` iterations multiplies an `m×k` by a `k×n` block,
/// advancing each operand by its `*_step` elements. A step of zero reuses
/// the same block every iteration (how convolution shares one weight
/// matrix across the batch).
#[derive(Debug, Clone, Copy)]
pub struct GemmSpec {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub batch: usize,
    pub a_step: usize,
    pub b_step: usize,
    pub y_step: usize,
    /// Fused bias broadcast: `y[i] += bias[(i / inner) % len]` over the
    /// whole output. Zero `len` means no bias even if one is staged.
    pub bias_len: usize,
    pub bias_inner: usize,
}

impl GemmSpec {
    /// Plain single GEMM, no bias.
    pub fn single(m: usize, n: usize, k: usize) -> Self {
        GemmSpec {
            m,
            n,
            k,
            batch: 1,
            a_step: 0,
            b_step: 0,
            y_step: 0,
            bias_len: 0,
            bias_inner: 1,
        }
    }
}

#[derive(Debug)]
struct GemmStage {
    y: Tensor,
    a: Tensor,
    b: Tensor,
    bias: Option<Tensor>,
    spec: GemmSpec,
}

/// Handle to the device GEMM: `y = alpha * op(a) @ op(b) + beta * y`,
/// with optional fused bias broadcast. Matrix multiplication itself goes
/// through cuBLAS; the bias add is an Ember kernel.
#[derive(Debug)]
pub struct GemmKernel {
    ctx: DeviceContext,
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
    beta: f32,
    staged: Option<GemmStage>,
}

impl GemmKernel {
    pub fn new(ctx: &DeviceContext, trans_a: bool, trans_b: bool, alpha: f32, beta: f32) -> Self {
        GemmKernel {
            ctx: ctx.clone(),
            trans_a,
            trans_b,
            alpha,
            beta,
            staged: None,
        }
    }

    /// Bind the operand tensors. Device buffers are allocated and brought
    /// current here; no arithmetic happens until `run()`.
    pub fn stage(
        &mut self,
        y: &Tensor,
        a: &Tensor,
        b: &Tensor,
        bias: Option<&Tensor>,
        spec: GemmSpec,
    ) -> Result<()> {
        y.prepare_device(&self.ctx, true)?;
        a.prepare_device(&self.ctx, true)?;
        b.prepare_device(&self.ctx, true)?;
        if let Some(bias) = bias {
            bias.prepare_device(&self.ctx, true)?;
        }
        self.staged = Some(GemmStage {
            y: y.clone(),
            a: a.clone(),
            b: b.clone(),
            bias: bias.cloned(),
            spec,
        });
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let st = self.staged.take().ok_or(Error::KernelNotStaged("gemm"))?;
        let spec = st.spec;
        let (m, n, k) = (spec.m, spec.n, spec.k);

        {
            let a_guard = st.a.lock()?;
            let b_guard = st.b.lock()?;
            let y_guard = st.y.lock()?;
            let a_slice = a_guard.device_f32()?;
            let b_slice = b_guard.device_f32()?;
            let y_slice = y_guard.device_f32()?;

            // Row-major GEMM through column-major cuBLAS: swap the operand
            // roles and flip m/n, so no data ever gets transposed in memory.
            let (op_a, lda) = if self.trans_a {
                (cublasOperation_t::CUBLAS_OP_T, m as i32)
            } else {
                (cublasOperation_t::CUBLAS_OP_N, k as i32)
            };
            let (op_b, ldb) = if self.trans_b {
                (cublasOperation_t::CUBLAS_OP_T, k as i32)
            } else {
                (cublasOperation_t::CUBLAS_OP_N, n as i32)
            };

            for i in 0..spec.batch {
                let a_view = a_slice.slice(i * spec.a_step..i * spec.a_step + m * k);
                let b_view = b_slice.slice(i * spec.b_step..i * spec.b_step + k * n);
                let y_view = y_slice.slice(i * spec.y_step..i * spec.y_step + m * n);
                unsafe {
                    cudarc::cublas::result::sgemm(
                        *self.ctx.blas().handle(),
                        op_b,
                        op_a,
                        n as i32,
                        m as i32,
                        k as i32,
                        (&self.alpha) as *const f32,
                        *b_view.device_ptr() as *const f32,
                        ldb,
                        *a_view.device_ptr() as *const f32,
                        lda,
                        (&self.beta) as *const f32,
                        *y_view.device_ptr() as *mut f32,
                        n as i32,
                    )
                }
                .map_err(|e| Error::Device(format!("cuBLAS sgemm: {e}")))?;
            }
        }

        if let (Some(bias), true) = (&st.bias, spec.bias_len > 0) {
            let total = st.y.size();
            let func = self.ctx.get_func("bias_add_f32")?;
            let bias_guard = bias.lock()?;
            let mut y_guard = st.y.lock()?;
            let bias_slice = bias_guard.device_f32()?;
            let y_slice = y_guard.device_f32_mut()?;
            unsafe {
                func.launch(
                    launch_cfg(total),
                    (
                        y_slice,
                        bias_slice,
                        spec.bias_len as u32,
                        spec.bias_inner as u32,
                        total as u32,
                    ),
                )
            }
            .map_err(|e| Error::Device(format!("bias_add launch: {e}")))?;
        }

        st.y.mark_device_ahead()
    }
}

/// CPU reference for the GEMM handle:
/// `y = alpha * op(a) @ op(b) + beta * y` for one block.
#[allow(clippy::too_many_arguments)]
pub fn gemm_cpu(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    y: &mut [f32],
) {
    y.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, out) in row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for l in 0..k {
                let av = if trans_a { a[l * m + i] } else { a[i * k + l] };
                let bv = if trans_b { b[j * k + l] } else { b[l * n + j] };
                acc += av * bv;
            }
            *out = alpha * acc + beta * *out;
        }
    });
}

/// CPU reference for the fused bias broadcast.
pub fn bias_add_cpu(y: &mut [f32], bias: &[f32], inner: usize) {
    let len = bias.len();
    for (i, v) in y.iter_mut().enumerate() {
        *v += bias[(i / inner) % len];
    }
}

//  BIAS GRADIENT (reduction)

/// Handle to the bias-gradient reduction: `dy` viewed as
/// `[outer, bias_len, inner]` blocks, summed over `outer` and `inner`.
#[derive(Debug)]
pub struct BiasGradKernel {
    ctx: DeviceContext,
    staged: Option<(Tensor, Tensor, [usize; 3])>,
}

impl BiasGradKernel {
    pub fn new(ctx: &DeviceContext) -> Self {
        BiasGradKernel {
            ctx: ctx.clone(),
            staged: None,
        }
    }

    pub fn stage(
        &mut self,
        db: &Tensor,
        dy: &Tensor,
        outer: usize,
        bias_len: usize,
        inner: usize,
    ) -> Result<()> {
        if outer * bias_len * inner != dy.size() {
            bail!(
                "bias_grad: {}x{}x{} blocks do not cover {} elements",
                outer,
                bias_len,
                inner,
                dy.size()
            );
        }
        db.prepare_device(&self.ctx, true)?;
        dy.prepare_device(&self.ctx, true)?;
        self.staged = Some((db.clone(), dy.clone(), [outer, bias_len, inner]));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (db, dy, [outer, bias_len, inner]) =
            self.staged.take().ok_or(Error::KernelNotStaged("bias_grad"))?;
        {
            let func = self.ctx.get_func("bias_grad_f32")?;
            let dy_guard = dy.lock()?;
            let mut db_guard = db.lock()?;
            let dy_slice = dy_guard.device_f32()?;
            let db_slice = db_guard.device_f32_mut()?;
            unsafe {
                func.launch(
                    launch_cfg(bias_len),
                    (db_slice, dy_slice, outer as u32, bias_len as u32, inner as u32),
                )
            }
            .map_err(|e| Error::Device(format!("bias_grad launch: {e}")))?;
        }
        db.mark_device_ahead()
    }
}

/// CPU reference for the bias-gradient reduction.
pub fn bias_grad_cpu(db: &mut [f32], dy: &[f32], outer: usize, inner: usize) {
    let bias_len = db.len();
    for j in 0..bias_len {
        let mut acc = 0.0f32;
        for o in 0..outer {
            let base = (o * bias_len + j) * inner;
            for c in 0..inner {
                acc += dy[base + c];
            }
        }
        db[j] = acc;
    }
}

//  ELEMENTWISE MAPS

/// Elementwise transforms with device kernels and CPU references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    Relu,
    Sigmoid,
    Tanh,
}

impl MapOp {
    fn forward_name(self) -> &'static str {
        match self {
            MapOp::Relu => "relu_f32",
            MapOp::Sigmoid => "sigmoid_f32",
            MapOp::Tanh => "tanh_f32",
        }
    }

    fn grad_name(self) -> &'static str {
        match self {
            MapOp::Relu => "relu_grad_f32",
            MapOp::Sigmoid => "sigmoid_grad_f32",
            MapOp::Tanh => "tanh_grad_f32",
        }
    }

    /// CPU reference of the forward map.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            MapOp::Relu => x.max(0.0),
            MapOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            MapOp::Tanh => x.tanh(),
        }
    }

    /// CPU reference of the backward map. `reference` is the forward
    /// *input* for ReLU and the forward *output* for sigmoid/tanh.
    pub fn grad(self, reference: f32, dy: f32) -> f32 {
        match self {
            MapOp::Relu => {
                if reference > 0.0 {
                    dy
                } else {
                    0.0
                }
            }
            MapOp::Sigmoid => reference * (1.0 - reference) * dy,
            MapOp::Tanh => (1.0 - reference * reference) * dy,
        }
    }
}

/// Handle to an elementwise forward map: `y[i] = op(x[i])`.
pub struct MapKernel {
    ctx: DeviceContext,
    op: MapOp,
    staged: Option<(Tensor, Tensor)>,
}

impl MapKernel {
    pub fn new(ctx: &DeviceContext, op: MapOp) -> Self {
        MapKernel {
            ctx: ctx.clone(),
            op,
            staged: None,
        }
    }

    pub fn stage(&mut self, y: &Tensor, x: &Tensor) -> Result<()> {
        if y.size() != x.size() {
            bail!("map: output has {} elements, input {}", y.size(), x.size());
        }
        y.prepare_device(&self.ctx, true)?;
        x.prepare_device(&self.ctx, true)?;
        self.staged = Some((y.clone(), x.clone()));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (y, x) = self.staged.take().ok_or(Error::KernelNotStaged("map"))?;
        let n = x.size();
        {
            let func = self.ctx.get_func(self.op.forward_name())?;
            let x_guard = x.lock()?;
            let mut y_guard = y.lock()?;
            let x_slice = x_guard.device_f32()?;
            let y_slice = y_guard.device_f32_mut()?;
            unsafe { func.launch(launch_cfg(n), (y_slice, x_slice, n as u32)) }
                .map_err(|e| Error::Device(format!("map launch: {e}")))?;
        }
        y.mark_device_ahead()
    }
}

/// Handle to an elementwise backward map: `dx[i] = op'(ref[i]) * dy[i]`.
pub struct MapGradKernel {
    ctx: DeviceContext,
    op: MapOp,
    staged: Option<(Tensor, Tensor, Tensor)>,
}

impl MapGradKernel {
    pub fn new(ctx: &DeviceContext, op: MapOp) -> Self {
        MapGradKernel {
            ctx: ctx.clone(),
            op,
            staged: None,
        }
    }

    /// `reference` is the forward input for ReLU, the forward output for
    /// sigmoid/tanh — matching [`MapOp::grad`].
    pub fn stage(&mut self, dx: &Tensor, reference: &Tensor, dy: &Tensor) -> Result<()> {
        dx.prepare_device(&self.ctx, true)?;
        reference.prepare_device(&self.ctx, true)?;
        dy.prepare_device(&self.ctx, true)?;
        self.staged = Some((dx.clone(), reference.clone(), dy.clone()));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (dx, reference, dy) = self.staged.take().ok_or(Error::KernelNotStaged("map_grad"))?;
        let n = dx.size();
        {
            let func = self.ctx.get_func(self.op.grad_name())?;
            let ref_guard = reference.lock()?;
            let dy_guard = dy.lock()?;
            let mut dx_guard = dx.lock()?;
            let ref_slice = ref_guard.device_f32()?;
            let dy_slice = dy_guard.device_f32()?;
            let dx_slice = dx_guard.device_f32_mut()?;
            unsafe { func.launch(launch_cfg(n), (dx_slice, ref_slice, dy_slice, n as u32)) }
                .map_err(|e| Error::Device(format!("map_grad launch: {e}")))?;
        }
        dx.mark_device_ahead()
    }
}

//  SPATIAL LOWERING

/// Which direction the lowering kernel moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweringDir {
    /// vol2col: gather patches into the column matrix.
    Gather,
    /// col2vol: scatter-accumulate the column matrix into the volume.
    Scatter,
}

/// Handle to the device lowering transform. The 20-int configuration is
/// uploaded once, on first stage.
#[derive(Debug)]
pub struct LoweringKernel {
    ctx: DeviceContext,
    dir: LoweringDir,
    lowering: Lowering,
    cfg_dev: Option<CudaSlice<i32>>,
    staged: Option<(Tensor, Tensor)>,
}

impl LoweringKernel {
    pub fn new(ctx: &DeviceContext, dir: LoweringDir, lowering: Lowering) -> Self {
        LoweringKernel {
            ctx: ctx.clone(),
            dir,
            lowering,
            cfg_dev: None,
            staged: None,
        }
    }

    /// `dst`/`src` are (col, vol) for Gather and (vol, col) for Scatter.
    pub fn stage(&mut self, dst: &Tensor, src: &Tensor) -> Result<()> {
        dst.prepare_device(&self.ctx, true)?;
        src.prepare_device(&self.ctx, true)?;
        if self.cfg_dev.is_none() {
            self.cfg_dev = Some(self.ctx.htod_i32(self.lowering.device_config())?);
        }
        self.staged = Some((dst.clone(), src.clone()));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (dst, src) = self.staged.take().ok_or(Error::KernelNotStaged("lowering"))?;
        let n = self.lowering.batch * self.lowering.rows();
        let cfg = self
            .cfg_dev
            .as_ref()
            .ok_or_else(|| Error::msg("lowering config not uploaded"))?;
        {
            let src_guard = src.lock()?;
            let mut dst_guard = dst.lock()?;
            let src_slice = src_guard.device_f32()?;
            let dst_slice = dst_guard.device_f32_mut()?;
            match self.dir {
                LoweringDir::Gather => {
                    let func = self.ctx.get_func("vol2col_f32")?;
                    unsafe { func.launch(launch_cfg(n), (src_slice, dst_slice, cfg, n as u32)) }
                        .map_err(|e| Error::Device(format!("vol2col launch: {e}")))?;
                }
                LoweringDir::Scatter => {
                    let func = self.ctx.get_func("col2vol_f32")?;
                    unsafe { func.launch(launch_cfg(n), (dst_slice, src_slice, cfg, n as u32)) }
                        .map_err(|e| Error::Device(format!("col2vol launch: {e}")))?;
                }
            }
        }
        dst.mark_device_ahead()
    }
}

//  COLUMN MAX (pooling)

/// Handle to the per-channel column max: over a lowered matrix whose rows
/// group as [channels][kvol], takes the max across the kvol taps of each
/// (batch, channel, cell) and records the winning tap index.
pub struct ColMaxKernel {
    ctx: DeviceContext,
    staged: Option<(Tensor, Tensor, Tensor, [usize; 3])>,
}

impl ColMaxKernel {
    pub fn new(ctx: &DeviceContext) -> Self {
        ColMaxKernel {
            ctx: ctx.clone(),
            staged: None,
        }
    }

    pub fn stage(
        &mut self,
        y: &Tensor,
        idx: &Tensor,
        col: &Tensor,
        channels: usize,
        kvol: usize,
        cells: usize,
    ) -> Result<()> {
        y.prepare_device(&self.ctx, true)?;
        idx.prepare_device(&self.ctx, true)?;
        col.prepare_device(&self.ctx, true)?;
        self.staged = Some((y.clone(), idx.clone(), col.clone(), [channels, kvol, cells]));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (y, idx, col, [channels, kvol, cells]) =
            self.staged.take().ok_or(Error::KernelNotStaged("col_max"))?;
        let n = y.size();
        {
            let func = self.ctx.get_func("col_max_f32")?;
            let col_guard = col.lock()?;
            let mut y_guard = y.lock()?;
            let mut idx_guard = idx.lock()?;
            let col_slice = col_guard.device_f32()?;
            let y_slice = y_guard.device_f32_mut()?;
            let idx_slice = idx_guard.device_i32_mut()?;
            unsafe {
                func.launch(
                    launch_cfg(n),
                    (
                        col_slice,
                        y_slice,
                        idx_slice,
                        channels as u32,
                        kvol as u32,
                        cells as u32,
                        n as u32,
                    ),
                )
            }
            .map_err(|e| Error::Device(format!("col_max launch: {e}")))?;
        }
        idx.mark_device_ahead()?;
        y.mark_device_ahead()
    }
}

/// CPU reference for the column max. Returns winning tap indices.
pub fn col_max_cpu(
    col: &[f32],
    y: &mut [f32],
    idx: &mut [i32],
    channels: usize,
    kvol: usize,
    cells: usize,
) {
    for (i, (out, win)) in y.iter_mut().zip(idx.iter_mut()).enumerate() {
        let cell = i % cells;
        let c = (i / cells) % channels;
        let b = i / (cells * channels);
        let base = ((b * channels + c) * kvol) * cells + cell;
        let mut best = col[base];
        let mut best_k = 0i32;
        for k in 1..kvol {
            let v = col[base + k * cells];
            if v > best {
                best = v;
                best_k = k as i32;
            }
        }
        *out = best;
        *win = best_k;
    }
}

/// Handle to the column-max backward scatter: routes each output-cell
/// gradient to the tap that won the forward max. The destination column
/// gradient is zeroed first.
pub struct ColMaxScatterKernel {
    ctx: DeviceContext,
    staged: Option<(Tensor, Tensor, Tensor, [usize; 3])>,
}

impl ColMaxScatterKernel {
    pub fn new(ctx: &DeviceContext) -> Self {
        ColMaxScatterKernel {
            ctx: ctx.clone(),
            staged: None,
        }
    }

    pub fn stage(
        &mut self,
        dcol: &Tensor,
        idx: &Tensor,
        dy: &Tensor,
        channels: usize,
        kvol: usize,
        cells: usize,
    ) -> Result<()> {
        dcol.prepare_device(&self.ctx, true)?;
        idx.prepare_device(&self.ctx, true)?;
        dy.prepare_device(&self.ctx, true)?;
        self.staged = Some((dcol.clone(), idx.clone(), dy.clone(), [channels, kvol, cells]));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (dcol, idx, dy, [channels, kvol, cells]) = self
            .staged
            .take()
            .ok_or(Error::KernelNotStaged("col_max_scatter"))?;
        let n = dy.size();
        let total = dcol.size();
        {
            let fill = self.ctx.get_func("fill_f32")?;
            let scatter = self.ctx.get_func("col_max_scatter_f32")?;
            let idx_guard = idx.lock()?;
            let dy_guard = dy.lock()?;
            let mut dcol_guard = dcol.lock()?;
            let idx_slice = idx_guard.device_i32()?;
            let dy_slice = dy_guard.device_f32()?;
            let dcol_slice = dcol_guard.device_f32_mut()?;
            unsafe { fill.launch(launch_cfg(total), (&mut *dcol_slice, 0.0f32, total as u32)) }
                .map_err(|e| Error::Device(format!("fill launch: {e}")))?;
            unsafe {
                scatter.launch(
                    launch_cfg(n),
                    (
                        dcol_slice,
                        idx_slice,
                        dy_slice,
                        channels as u32,
                        kvol as u32,
                        cells as u32,
                        n as u32,
                    ),
                )
            }
            .map_err(|e| Error::Device(format!("col_max_scatter launch: {e}")))?;
        }
        dcol.mark_device_ahead()
    }
}

/// CPU reference for the column-max backward scatter.
pub fn col_max_scatter_cpu(
    dcol: &mut [f32],
    idx: &[i32],
    dy: &[f32],
    channels: usize,
    kvol: usize,
    cells: usize,
) {
    dcol.iter_mut().for_each(|v| *v = 0.0);
    for (i, (&g, &win)) in dy.iter().zip(idx.iter()).enumerate() {
        let cell = i % cells;
        let c = (i / cells) % channels;
        let b = i / (cells * channels);
        let base = ((b * channels + c) * kvol) * cells + cell;
        dcol[base + win as usize * cells] = g;
    }
}

//  OPTIMIZER STEPS

/// Handle to the device SGD step. Stages use the non-joining tensor
/// preparation: the step runs as the parameter's pending operation.
pub struct SgdKernel {
    ctx: DeviceContext,
    hp: [f32; 5],
    staged: Option<(Tensor, Tensor, Tensor)>,
}

impl SgdKernel {
    pub fn new(
        ctx: &DeviceContext,
        lr: f32,
        momentum: f32,
        dampening: f32,
        weight_decay: f32,
        nesterov: bool,
    ) -> Self {
        SgdKernel {
            ctx: ctx.clone(),
            hp: [lr, momentum, dampening, weight_decay, if nesterov { 1.0 } else { 0.0 }],
            staged: None,
        }
    }

    pub fn stage(&mut self, p: &Tensor, g: &Tensor, v: &Tensor) -> Result<()> {
        p.prepare_device(&self.ctx, false)?;
        g.prepare_device(&self.ctx, false)?;
        v.prepare_device(&self.ctx, false)?;
        self.staged = Some((p.clone(), g.clone(), v.clone()));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (p, g, v) = self.staged.take().ok_or(Error::KernelNotStaged("sgd_step"))?;
        let n = p.size();
        let hp = self.ctx.htod_f32(self.hp.to_vec())?;
        {
            let func = self.ctx.get_func("sgd_step_f32")?;
            let g_guard = g.lock()?;
            let mut p_guard = p.lock()?;
            let mut v_guard = v.lock()?;
            let g_slice = g_guard.device_f32()?;
            let p_slice = p_guard.device_f32_mut()?;
            let v_slice = v_guard.device_f32_mut()?;
            unsafe { func.launch(launch_cfg(n), (p_slice, g_slice, v_slice, &hp, n as u32)) }
                .map_err(|e| Error::Device(format!("sgd_step launch: {e}")))?;
        }
        v.mark_device_ahead()?;
        p.mark_device_ahead()
    }
}

/// Handle to the device Adam step.
pub struct AdamKernel {
    ctx: DeviceContext,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    amsgrad: bool,
    staged: Option<(Tensor, Tensor, Tensor, Tensor, Tensor, u32)>,
}

impl AdamKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &DeviceContext,
        lr: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
        weight_decay: f32,
        amsgrad: bool,
    ) -> Self {
        AdamKernel {
            ctx: ctx.clone(),
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            amsgrad,
            staged: None,
        }
    }

    /// `step` is the 1-based step count used for bias correction.
    pub fn stage(
        &mut self,
        p: &Tensor,
        g: &Tensor,
        m: &Tensor,
        r: &Tensor,
        rmax: &Tensor,
        step: u32,
    ) -> Result<()> {
        for t in [p, g, m, r, rmax] {
            t.prepare_device(&self.ctx, false)?;
        }
        self.staged = Some((p.clone(), g.clone(), m.clone(), r.clone(), rmax.clone(), step));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (p, g, m, r, rmax, step) =
            self.staged.take().ok_or(Error::KernelNotStaged("adam_step"))?;
        let n = p.size();
        let c1 = 1.0 - self.beta1.powi(step as i32);
        let c2 = 1.0 - self.beta2.powi(step as i32);
        let hp = self.ctx.htod_f32(vec![
            self.lr,
            self.beta1,
            self.beta2,
            self.eps,
            self.weight_decay,
            c1,
            c2,
            if self.amsgrad { 1.0 } else { 0.0 },
        ])?;
        {
            let func = self.ctx.get_func("adam_step_f32")?;
            let g_guard = g.lock()?;
            let mut p_guard = p.lock()?;
            let mut m_guard = m.lock()?;
            let mut r_guard = r.lock()?;
            let mut rmax_guard = rmax.lock()?;
            let g_slice = g_guard.device_f32()?;
            let p_slice = p_guard.device_f32_mut()?;
            let m_slice = m_guard.device_f32_mut()?;
            let r_slice = r_guard.device_f32_mut()?;
            let rmax_slice = rmax_guard.device_f32_mut()?;
            unsafe {
                func.launch(
                    launch_cfg(n),
                    (p_slice, g_slice, m_slice, r_slice, rmax_slice, &hp, n as u32),
                )
            }
            .map_err(|e| Error::Device(format!("adam_step launch: {e}")))?;
        }
        m.mark_device_ahead()?;
        r.mark_device_ahead()?;
        rmax.mark_device_ahead()?;
        p.mark_device_ahead()
    }
}

/// Handle to the device RMSProp step.
pub struct RmsPropKernel {
    ctx: DeviceContext,
    hp: [f32; 4],
    staged: Option<(Tensor, Tensor, Tensor)>,
}

impl RmsPropKernel {
    pub fn new(ctx: &DeviceContext, lr: f32, alpha: f32, eps: f32, weight_decay: f32) -> Self {
        RmsPropKernel {
            ctx: ctx.clone(),
            hp: [lr, alpha, eps, weight_decay],
            staged: None,
        }
    }

    pub fn stage(&mut self, p: &Tensor, g: &Tensor, v: &Tensor) -> Result<()> {
        p.prepare_device(&self.ctx, false)?;
        g.prepare_device(&self.ctx, false)?;
        v.prepare_device(&self.ctx, false)?;
        self.staged = Some((p.clone(), g.clone(), v.clone()));
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (p, g, v) = self
            .staged
            .take()
            .ok_or(Error::KernelNotStaged("rmsprop_step"))?;
        let n = p.size();
        let hp = self.ctx.htod_f32(self.hp.to_vec())?;
        {
            let func = self.ctx.get_func("rmsprop_step_f32")?;
            let g_guard = g.lock()?;
            let mut p_guard = p.lock()?;
            let mut v_guard = v.lock()?;
            let g_slice = g_guard.device_f32()?;
            let p_slice = p_guard.device_f32_mut()?;
            let v_slice = v_guard.device_f32_mut()?;
            unsafe { func.launch(launch_cfg(n), (p_slice, g_slice, v_slice, &hp, n as u32)) }
                .map_err(|e| Error::Device(format!("rmsprop_step launch: {e}")))?;
        }
        v.mark_device_ahead()?;
        p.mark_device_ahead()
    }
}
