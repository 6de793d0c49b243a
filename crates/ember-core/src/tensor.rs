use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::CudaSlice;

use crate::device::{DeviceBuffer, DeviceContext, DeviceSide};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::pool::TaskHandle;
use crate::shape::Shape;

// Tensor — a dual-residency buffer
//
// A tensor's value can live in a host buffer, a device buffer, or both.
// At most one side is ever *ahead* (authoritative): writing through a
// host accessor marks the host ahead, a kernel writing the device buffer
// marks the device ahead, and touching the stale side first reconciles
// it with a copy. When neither side is ahead the copies agree and
// accessors are free.
//
// Every accessor also joins the tensor's pending task handle first: work
// queued against this tensor (an optimizer step, a staged registration)
// must have landed before either residency is trusted. An error raised
// inside that task therefore surfaces here, at the join, not where the
// work was queued.
//
// The handle/inner split mirrors the rest of the framework: `Tensor` is
// a cheap Arc clone, all mutable state sits behind one mutex. There is
// no cross-tensor sharing — each tensor owns exactly one host buffer
// and at most one device buffer.

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier for a tensor, used by the session graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn fresh() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) enum HostBuffer {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl HostBuffer {
    pub(crate) fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => HostBuffer::F32(vec![0.0; len]),
            DType::I32 => HostBuffer::I32(vec![0; len]),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            HostBuffer::F32(v) => v.len(),
            HostBuffer::I32(v) => v.len(),
        }
    }

    pub(crate) fn dtype(&self) -> DType {
        match self {
            HostBuffer::F32(_) => DType::F32,
            HostBuffer::I32(_) => DType::I32,
        }
    }

    pub(crate) fn as_f32(&self) -> Result<&[f32]> {
        match self {
            HostBuffer::F32(v) => Ok(v),
            HostBuffer::I32(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
        }
    }

    pub(crate) fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match self {
            HostBuffer::F32(v) => Ok(v),
            HostBuffer::I32(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
        }
    }

    pub(crate) fn as_i32(&self) -> Result<&[i32]> {
        match self {
            HostBuffer::I32(v) => Ok(v),
            HostBuffer::F32(_) => Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: DType::F32,
            }),
        }
    }
}

pub(crate) struct TensorState {
    pub(crate) shape: Shape,
    pub(crate) init_shape: Shape,
    pub(crate) host: HostBuffer,
    pub(crate) device: Option<DeviceSide>,
    /// Host buffer holds writes the device has not seen.
    pub(crate) host_ahead: bool,
    /// Device buffer holds writes the host has not seen.
    pub(crate) device_ahead: bool,
    /// In-flight asynchronous operation touching this tensor.
    pub(crate) pending: Option<TaskHandle<()>>,
    /// Lazily allocated gradient, same shape, not tracking its own gradient.
    pub(crate) grad: Option<Tensor>,
}

impl TensorState {
    pub(crate) fn device_f32(&self) -> Result<&CudaSlice<f32>> {
        match self.device.as_ref().map(|s| &s.buf) {
            Some(DeviceBuffer::F32(slice)) => Ok(slice),
            Some(DeviceBuffer::I32(_)) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
            None => Err(Error::msg("tensor has no device buffer")),
        }
    }

    pub(crate) fn device_f32_mut(&mut self) -> Result<&mut CudaSlice<f32>> {
        match self.device.as_mut().map(|s| &mut s.buf) {
            Some(DeviceBuffer::F32(slice)) => Ok(slice),
            Some(DeviceBuffer::I32(_)) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
            None => Err(Error::msg("tensor has no device buffer")),
        }
    }

    pub(crate) fn device_i32(&self) -> Result<&CudaSlice<i32>> {
        match self.device.as_ref().map(|s| &s.buf) {
            Some(DeviceBuffer::I32(slice)) => Ok(slice),
            Some(DeviceBuffer::F32(_)) => Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: DType::F32,
            }),
            None => Err(Error::msg("tensor has no device buffer")),
        }
    }

    pub(crate) fn device_i32_mut(&mut self) -> Result<&mut CudaSlice<i32>> {
        match self.device.as_mut().map(|s| &mut s.buf) {
            Some(DeviceBuffer::I32(slice)) => Ok(slice),
            Some(DeviceBuffer::F32(_)) => Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: DType::F32,
            }),
            None => Err(Error::msg("tensor has no device buffer")),
        }
    }
}

struct TensorInner {
    id: TensorId,
    dtype: DType,
    requires_grad: bool,
    state: Mutex<TensorState>,
}

/// An n-dimensional buffer with host and device residency.
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = self
            .inner
            .state
            .lock()
            .map(|g| g.shape.clone())
            .unwrap_or_else(|_| Shape::new(vec![]));
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={})",
            self.inner.id, shape, self.inner.dtype
        )
    }
}

impl Tensor {
    fn new_inner(host: HostBuffer, shape: Shape, requires_grad: bool) -> Self {
        debug_assert_eq!(host.len(), shape.elem_count());
        let dtype = host.dtype();
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::fresh(),
                dtype,
                requires_grad,
                state: Mutex::new(TensorState {
                    init_shape: shape.clone(),
                    shape,
                    host,
                    device: None,
                    host_ahead: false,
                    device_ahead: false,
                    pending: None,
                    grad: None,
                }),
            }),
        }
    }

    //  Construction

    /// Build an f32 tensor from a flat buffer. Fails unless
    /// `product(shape) == data.len()`.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::new_inner(HostBuffer::F32(data), shape, true))
    }

    /// Build an i32 tensor from a flat buffer (labels, indices).
    pub fn from_vec_i32(data: Vec<i32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::new_inner(HostBuffer::I32(data), shape, true))
    }

    /// All-zero f32 tensor.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self::new_inner(HostBuffer::F32(vec![0.0; shape.elem_count()]), shape, true)
    }

    /// All-one f32 tensor.
    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Constant-filled f32 tensor.
    pub fn full(shape: impl Into<Shape>, val: f32) -> Self {
        let shape = shape.into();
        Self::new_inner(HostBuffer::F32(vec![val; shape.elem_count()]), shape, true)
    }

    /// f32 tensor generated per flat index.
    pub fn from_fn(shape: impl Into<Shape>, f: impl FnMut(usize) -> f32) -> Self {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count()).map(f).collect();
        Self::new_inner(HostBuffer::F32(data), shape, true)
    }

    /// A tensor that refuses gradient allocation (internal: gradients
    /// themselves, scratch buffers).
    pub fn zeros_untracked(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self::new_inner(HostBuffer::F32(vec![0.0; shape.elem_count()]), shape, false)
    }

    //  Metadata

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Current shape (a clone; the live shape can change via reshape).
    pub fn shape(&self) -> Shape {
        self.lock()
            .map(|g| g.shape.clone())
            .unwrap_or_else(|_| Shape::new(vec![]))
    }

    /// Current dimensions.
    pub fn dims(&self) -> Vec<usize> {
        self.shape().dims().to_vec()
    }

    pub fn rank(&self) -> usize {
        self.shape().rank()
    }

    /// Total number of elements; equals the host buffer length.
    pub fn size(&self) -> usize {
        self.lock().map(|g| g.host.len()).unwrap_or(0)
    }

    //  Synchronization

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, TensorState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| Error::msg("tensor lock poisoned"))
    }

    /// Join the in-flight operation, if any, propagating its failure.
    pub fn wait(&self) -> Result<()> {
        let pending = { self.lock()?.pending.take() };
        match pending {
            Some(h) => h.wait(),
            None => Ok(()),
        }
    }

    /// Attach an in-flight operation. Any previously attached operation
    /// is joined first, so at most one is outstanding per tensor.
    pub fn set_pending(&self, handle: TaskHandle<()>) -> Result<()> {
        let old = { self.lock()?.pending.replace(handle) };
        match old {
            Some(h) => h.wait(),
            None => Ok(()),
        }
    }

    /// Copy device → host if the device side is ahead.
    fn sync_host(state: &mut TensorState) -> Result<()> {
        if state.device_ahead {
            let side = state
                .device
                .as_ref()
                .ok_or_else(|| Error::msg("device marked ahead but no device buffer"))?;
            match &mut state.host {
                HostBuffer::F32(v) => side.download_f32(v)?,
                HostBuffer::I32(v) => side.download_i32(v)?,
            }
            state.device_ahead = false;
        }
        Ok(())
    }

    /// Ensure the device buffer exists and holds the current value.
    ///
    /// `join` controls whether the pending handle is joined first. The
    /// only callers passing `false` are optimizer kernels, which run *as*
    /// the tensor's pending operation and would deadlock joining themselves.
    pub(crate) fn prepare_device(&self, ctx: &DeviceContext, join: bool) -> Result<()> {
        if join {
            self.wait()?;
        }
        let mut g = self.lock()?;
        let state = &mut *g;
        if state.device.is_none() {
            let mut side = DeviceSide::alloc(ctx, self.inner.dtype, state.host.len())?;
            match &state.host {
                HostBuffer::F32(v) => side.upload_f32(v)?,
                HostBuffer::I32(v) => side.upload_i32(v)?,
            }
            state.device = Some(side);
            state.host_ahead = false;
        } else if state.host_ahead {
            let side = state
                .device
                .as_mut()
                .ok_or_else(|| Error::msg("no device buffer"))?;
            match &state.host {
                HostBuffer::F32(v) => side.upload_f32(v)?,
                HostBuffer::I32(v) => side.upload_i32(v)?,
            }
            state.host_ahead = false;
        }
        Ok(())
    }

    /// Mark the device buffer authoritative (a kernel just wrote it).
    pub(crate) fn mark_device_ahead(&self) -> Result<()> {
        let mut g = self.lock()?;
        g.device_ahead = true;
        g.host_ahead = false;
        Ok(())
    }

    /// Upload the host value to the device, allocating the buffer on
    /// first use.
    pub fn upload(&self, ctx: &DeviceContext) -> Result<()> {
        self.prepare_device(ctx, true)
    }

    /// Copy the device value back into the host buffer (unconditionally,
    /// if a device buffer exists).
    pub fn download(&self) -> Result<()> {
        self.wait()?;
        let mut g = self.lock()?;
        let state = &mut *g;
        if let Some(side) = state.device.as_ref() {
            match &mut state.host {
                HostBuffer::F32(v) => side.download_f32(v)?,
                HostBuffer::I32(v) => side.download_i32(v)?,
            }
            state.device_ahead = false;
        }
        Ok(())
    }

    //  Host access

    /// Read the host buffer after joining the pending operation and
    /// reconciling a device-side write.
    pub fn with_host_f32<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        self.wait()?;
        let mut g = self.lock()?;
        Self::sync_host(&mut g)?;
        Ok(f(g.host.as_f32()?))
    }

    /// Mutate the host buffer; the host side becomes authoritative.
    pub fn with_host_f32_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        self.wait()?;
        let mut g = self.lock()?;
        Self::sync_host(&mut g)?;
        let r = f(g.host.as_f32_mut()?);
        g.host_ahead = true;
        g.device_ahead = false;
        Ok(r)
    }

    /// Host access that skips the pending-handle join. Only for code
    /// running *as* the tensor's pending operation (optimizer step tasks);
    /// residency reconciliation still happens.
    pub fn with_host_f32_mut_direct<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        let mut g = self.lock()?;
        Self::sync_host(&mut g)?;
        let r = f(g.host.as_f32_mut()?);
        g.host_ahead = true;
        g.device_ahead = false;
        Ok(r)
    }

    /// Read-only variant of [`Tensor::with_host_f32_mut_direct`].
    pub fn with_host_f32_direct<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let mut g = self.lock()?;
        Self::sync_host(&mut g)?;
        Ok(f(g.host.as_f32()?))
    }

    /// Replace the host contents; length must match, host becomes
    /// authoritative.
    pub fn set_host_f32(&self, data: &[f32]) -> Result<()> {
        self.wait()?;
        let mut g = self.lock()?;
        if data.len() != g.host.len() {
            return Err(Error::ElementCountMismatch {
                shape: g.shape.clone(),
                expected: g.host.len(),
                got: data.len(),
            });
        }
        g.host.as_f32_mut()?.copy_from_slice(data);
        g.host_ahead = true;
        g.device_ahead = false;
        Ok(())
    }

    /// Copy the current value out as a flat f32 vector.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        self.with_host_f32(|h| h.to_vec())
    }

    /// Copy the current value out as a flat i32 vector.
    pub fn to_vec_i32(&self) -> Result<Vec<i32>> {
        self.wait()?;
        let mut g = self.lock()?;
        Self::sync_host(&mut g)?;
        Ok(g.host.as_i32()?.to_vec())
    }

    /// Replace the host contents of an i32 tensor; host becomes
    /// authoritative.
    pub fn set_host_i32(&self, data: &[i32]) -> Result<()> {
        self.wait()?;
        let mut g = self.lock()?;
        if data.len() != g.host.len() {
            return Err(Error::ElementCountMismatch {
                shape: g.shape.clone(),
                expected: g.host.len(),
                got: data.len(),
            });
        }
        match &mut g.host {
            HostBuffer::I32(v) => v.copy_from_slice(data),
            HostBuffer::F32(_) => {
                return Err(Error::DTypeMismatch {
                    expected: DType::I32,
                    got: DType::F32,
                })
            }
        }
        g.host_ahead = true;
        g.device_ahead = false;
        Ok(())
    }

    /// All-zero i32 tensor (pooling argmax caches, label buffers).
    pub fn zeros_i32(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self::new_inner(HostBuffer::I32(vec![0; shape.elem_count()]), shape, false)
    }

    /// Fill an f32 tensor with a constant; host becomes authoritative.
    pub fn fill(&self, val: f32) -> Result<()> {
        self.with_host_f32_mut(|h| h.iter_mut().for_each(|x| *x = val))
    }

    //  Gradient

    /// The gradient tensor, allocated (zeroed, same shape) on first
    /// request. Gradients are allocated lazily so unused ones cost nothing.
    pub fn grad(&self) -> Result<Tensor> {
        if !self.inner.requires_grad {
            return Err(Error::NoGradient);
        }
        let mut g = self.lock()?;
        if let Some(t) = &g.grad {
            return Ok(t.clone());
        }
        let t = Tensor::new_inner(
            HostBuffer::zeros(self.inner.dtype, g.host.len()),
            g.shape.clone(),
            false,
        );
        g.grad = Some(t.clone());
        Ok(t)
    }

    /// Whether the gradient has been allocated yet.
    pub fn grad_allocated(&self) -> bool {
        self.lock().map(|g| g.grad.is_some()).unwrap_or(false)
    }

    /// Zero the gradient. A no-op if no gradient was ever requested.
    pub fn zero_grad(&self) -> Result<()> {
        self.wait()?;
        let grad = { self.lock()?.grad.clone() };
        match grad {
            Some(g) => g.fill(0.0),
            None => Ok(()),
        }
    }

    //  Shape mutation

    /// Reshape in place. Fails when the element count differs; reshapes
    /// the gradient alongside. The device buffer is flat, so only the
    /// metadata changes.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<()> {
        let new_shape = shape.into();
        self.wait()?;
        let grad = {
            let mut g = self.lock()?;
            if new_shape.elem_count() != g.host.len() {
                return Err(Error::ReshapeElementMismatch {
                    src: g.host.len(),
                    dst: new_shape.elem_count(),
                    dst_shape: new_shape,
                });
            }
            g.shape = new_shape.clone();
            g.grad.clone()
        };
        match grad {
            Some(gr) => gr.reshape(new_shape),
            None => Ok(()),
        }
    }

    /// Restore the shape the tensor was constructed with.
    pub fn reset_shape(&self) -> Result<()> {
        let init = { self.lock()?.init_shape.clone() };
        self.reshape(init)
    }

    /// Permute the axes, physically reordering the host data. The host
    /// side becomes authoritative; the gradient is permuted alongside.
    pub fn transpose(&self, axes: &[usize]) -> Result<()> {
        self.wait()?;
        let grad = {
            let mut g = self.lock()?;
            Self::sync_host(&mut g)?;
            let old_shape = g.shape.clone();
            let new_shape = old_shape.permute(axes)?;
            match &mut g.host {
                HostBuffer::F32(v) => *v = permuted(v, old_shape.dims(), axes),
                HostBuffer::I32(v) => *v = permuted(v, old_shape.dims(), axes),
            }
            g.shape = new_shape;
            g.host_ahead = true;
            g.device_ahead = false;
            g.grad.clone()
        };
        match grad {
            Some(gr) => gr.transpose(axes),
            None => Ok(()),
        }
    }

    /// 2-D transpose shorthand.
    pub fn t(&self) -> Result<()> {
        if self.rank() != 2 {
            return Err(Error::msg(format!(
                "t() requires a 2-D tensor, got rank {}",
                self.rank()
            )));
        }
        self.transpose(&[1, 0])
    }

    //  One-hot expansion

    /// Expand the last axis into a one-hot encoding.
    ///
    /// With an explicit `label_count`, any value outside
    /// `[0, label_count)` fails. With `None`, the count is inferred as
    /// `max + 1` and only negative values fail.
    pub fn onehot(&self, label_count: Option<usize>) -> Result<Tensor> {
        let labels = self.to_labels()?;
        let count = match label_count {
            Some(c) => c,
            None => {
                let max = labels.iter().copied().max().unwrap_or(0).max(0);
                (max + 1) as usize
            }
        };
        for &v in &labels {
            if v < 0 || v >= count as i64 {
                return Err(Error::InvalidLabel {
                    value: v,
                    label_count: count,
                });
            }
        }
        let mut data = vec![0.0f32; labels.len() * count];
        for (i, &v) in labels.iter().enumerate() {
            data[i * count + v as usize] = 1.0;
        }
        let dims = { self.lock()?.init_shape.dims().to_vec() };
        let mut out_dims = dims.clone();
        if out_dims.last() == Some(&1) {
            out_dims.pop();
        }
        out_dims.push(count);
        Tensor::from_vec(data, out_dims)
    }

    fn to_labels(&self) -> Result<Vec<i64>> {
        self.wait()?;
        let mut g = self.lock()?;
        Self::sync_host(&mut g)?;
        Ok(match &g.host {
            HostBuffer::F32(v) => v.iter().map(|&x| x.round() as i64).collect(),
            HostBuffer::I32(v) => v.iter().map(|&x| x as i64).collect(),
        })
    }
}

/// Reorder a contiguous buffer under an axis permutation.
fn permuted<T: Copy>(data: &[T], dims: &[usize], axes: &[usize]) -> Vec<T> {
    let rank = dims.len();
    let mut old_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        old_strides[i] = old_strides[i + 1] * dims[i + 1];
    }
    let new_dims: Vec<usize> = axes.iter().map(|&a| dims[a]).collect();
    let mut out = Vec::with_capacity(data.len());
    let mut idx = vec![0usize; rank];
    for _ in 0..data.len() {
        let mut src = 0;
        for (d, &i) in idx.iter().enumerate() {
            src += i * old_strides[axes[d]];
        }
        out.push(data[src]);
        // Odometer increment over the permuted dims.
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < new_dims[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_checks_count() {
        let err = Tensor::from_vec(vec![1.0, 2.0, 3.0], (2, 2)).unwrap_err();
        assert!(matches!(err, Error::ElementCountMismatch { expected: 4, got: 3, .. }));
    }

    #[test]
    fn reshape_is_size_preserving() {
        let t = Tensor::from_vec((0..24).map(|i| i as f32).collect(), (2, 3, 4)).unwrap();
        t.reshape((6, 4)).unwrap();
        t.reshape((4, 6)).unwrap();
        let direct = Tensor::from_vec((0..24).map(|i| i as f32).collect(), (2, 3, 4)).unwrap();
        direct.reshape((4, 6)).unwrap();
        assert_eq!(t.dims(), direct.dims());
        assert_eq!(t.to_vec_f32().unwrap(), direct.to_vec_f32().unwrap());

        let err = t.reshape((5, 5)).unwrap_err();
        assert!(matches!(err, Error::ReshapeElementMismatch { src: 24, dst: 25, .. }));
    }

    #[test]
    fn reshape_carries_gradient() {
        let t = Tensor::zeros((2, 6));
        let g = t.grad().unwrap();
        t.reshape((3, 4)).unwrap();
        assert_eq!(g.dims(), vec![3, 4]);
    }

    #[test]
    fn transpose_2d() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
        t.t().unwrap();
        assert_eq!(t.dims(), vec![3, 2]);
        assert_eq!(t.to_vec_f32().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn zero_grad_is_noop_before_allocation() {
        let t = Tensor::zeros((3, 3));
        t.zero_grad().unwrap();
        assert!(!t.grad_allocated());
        // First request allocates a zeroed gradient of the same shape.
        let g = t.grad().unwrap();
        assert_eq!(g.dims(), vec![3, 3]);
        assert_eq!(g.to_vec_f32().unwrap(), vec![0.0; 9]);
    }

    #[test]
    fn gradient_does_not_track_its_own() {
        let t = Tensor::zeros(4);
        let g = t.grad().unwrap();
        assert!(matches!(g.grad().unwrap_err(), Error::NoGradient));
    }

    #[test]
    fn onehot_expands_last_axis() {
        let t = Tensor::from_vec_i32(vec![0, 2, 1], vec![3, 1]).unwrap();
        let y = t.onehot(Some(3)).unwrap();
        assert_eq!(y.dims(), vec![3, 3]);
        assert_eq!(
            y.to_vec_f32().unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn onehot_rejects_out_of_range() {
        let t = Tensor::from_vec_i32(vec![0, 3], vec![2, 1]).unwrap();
        let err = t.onehot(Some(3)).unwrap_err();
        assert!(matches!(err, Error::InvalidLabel { value: 3, label_count: 3 }));

        let neg = Tensor::from_vec(vec![-1.0], vec![1, 1]).unwrap();
        assert!(neg.onehot(None).is_err());
    }

    #[test]
    fn onehot_infers_label_count() {
        let t = Tensor::from_vec_i32(vec![1, 0, 4], vec![3, 1]).unwrap();
        let y = t.onehot(None).unwrap();
        assert_eq!(y.dims(), vec![3, 5]);
    }

    #[test]
    fn pending_task_joined_by_accessor() {
        use crate::pool::WorkerPool;
        let pool = WorkerPool::new(1);
        let t = Tensor::zeros(8);
        let tt = t.clone();
        let h = pool.submit(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            tt.with_host_f32_mut_direct(|v| v.iter_mut().for_each(|x| *x = 5.0))
        });
        t.set_pending(h).unwrap();
        // The read must observe the queued write.
        assert_eq!(t.to_vec_f32().unwrap(), vec![5.0; 8]);
    }

    #[test]
    fn pending_failure_surfaces_at_access() {
        use crate::pool::WorkerPool;
        let pool = WorkerPool::new(1);
        let t = Tensor::zeros(2);
        let h = pool.submit::<(), _>(|| Err(Error::msg("async boom")));
        t.set_pending(h).unwrap();
        let err = t.to_vec_f32().unwrap_err();
        assert!(matches!(err, Error::Msg(m) if m == "async boom"));
        // The failure was delivered; the tensor is usable again.
        assert_eq!(t.to_vec_f32().unwrap(), vec![0.0, 0.0]);
    }
}
