// DeviceContext — the CUDA side of the dual-residency model
//
// Wraps a cudarc device handle, a cuBLAS handle for GEMM, and the PTX
// module holding every Ember kernel (compiled once via NVRTC when the
// context is created). Tensors allocate their device buffers through
// this context lazily, on first device access.
//
// The framework depends only on the existence of a named, loadable
// function per operation (`get_func`); the compiled bytes are entirely
// the loader's business.

use std::sync::Arc;

use cudarc::cublas::CudaBlas;
use cudarc::driver::{CudaFunction, CudaSlice, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use tracing::{debug, info};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernels;

struct DeviceInner {
    dev: Arc<cudarc::driver::CudaDevice>,
    blas: CudaBlas,
    ordinal: usize,
}

/// Handle to one CUDA device with Ember's kernels loaded.
///
/// Cheap to clone (Arc inside); every tensor device buffer and kernel
/// handle created from a context keeps a clone so downloads never need
/// the context passed back in.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceContext(cuda:{})", self.inner.ordinal)
    }
}

impl DeviceContext {
    /// Bring up GPU `ordinal`: initialize the driver, create a cuBLAS
    /// handle, compile the kernel module, and load it.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::Device(format!("device {ordinal} init: {e}")))?;

        let blas = CudaBlas::new(dev.clone())
            .map_err(|e| Error::Device(format!("cuBLAS init: {e}")))?;

        // Target the device's own compute capability so NVRTC emits SASS
        // the installed driver is guaranteed to load.
        use cudarc::driver::sys::CUdevice_attribute_enum as Attr;
        let major = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(9);
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        debug!(ordinal, arch, "compiling kernel module");
        let opts = CompileOptions {
            arch: Some(arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::Device(format!("NVRTC compilation: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::Device(format!("PTX load: {e}")))?;

        info!(ordinal, kernels = kernels::KERNEL_NAMES.len(), "device context ready");
        Ok(DeviceContext {
            inner: Arc::new(DeviceInner { dev, blas, ordinal }),
        })
    }

    /// GPU ordinal this context drives.
    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    pub(crate) fn dev(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.inner.dev
    }

    pub(crate) fn blas(&self) -> &CudaBlas {
        &self.inner.blas
    }

    /// Resolve a compiled kernel by name.
    pub(crate) fn get_func(&self, name: &str) -> Result<CudaFunction> {
        self.inner
            .dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::Device(format!("kernel '{name}' not found")))
    }

    pub(crate) fn htod_i32(&self, data: Vec<i32>) -> Result<CudaSlice<i32>> {
        self.inner
            .dev
            .htod_copy(data)
            .map_err(|e| Error::Device(format!("htod i32: {e}")))
    }

    pub(crate) fn htod_f32(&self, data: Vec<f32>) -> Result<CudaSlice<f32>> {
        self.inner
            .dev
            .htod_copy(data)
            .map_err(|e| Error::Device(format!("htod f32: {e}")))
    }
}

/// Standard launch configuration for `n` elements.
pub(crate) fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

/// A device-resident copy of one tensor's buffer.
///
/// Holds the context it was allocated from so downloads are self-contained.
pub(crate) struct DeviceSide {
    pub(crate) ctx: DeviceContext,
    pub(crate) buf: DeviceBuffer,
}

pub(crate) enum DeviceBuffer {
    F32(CudaSlice<f32>),
    I32(CudaSlice<i32>),
}

impl DeviceSide {
    /// Allocate a zeroed buffer of `len` elements.
    pub(crate) fn alloc(ctx: &DeviceContext, dtype: DType, len: usize) -> Result<Self> {
        let buf = match dtype {
            DType::F32 => DeviceBuffer::F32(
                ctx.dev()
                    .alloc_zeros::<f32>(len)
                    .map_err(|e| Error::Device(format!("alloc f32[{len}]: {e}")))?,
            ),
            DType::I32 => DeviceBuffer::I32(
                ctx.dev()
                    .alloc_zeros::<i32>(len)
                    .map_err(|e| Error::Device(format!("alloc i32[{len}]: {e}")))?,
            ),
        };
        Ok(DeviceSide {
            ctx: ctx.clone(),
            buf,
        })
    }

    pub(crate) fn upload_f32(&mut self, host: &[f32]) -> Result<()> {
        match &mut self.buf {
            DeviceBuffer::F32(slice) => self
                .ctx
                .dev()
                .htod_sync_copy_into(host, slice)
                .map_err(|e| Error::Device(format!("upload f32: {e}"))),
            DeviceBuffer::I32(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
        }
    }

    pub(crate) fn upload_i32(&mut self, host: &[i32]) -> Result<()> {
        match &mut self.buf {
            DeviceBuffer::I32(slice) => self
                .ctx
                .dev()
                .htod_sync_copy_into(host, slice)
                .map_err(|e| Error::Device(format!("upload i32: {e}"))),
            DeviceBuffer::F32(_) => Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: DType::F32,
            }),
        }
    }

    pub(crate) fn download_f32(&self, host: &mut [f32]) -> Result<()> {
        match &self.buf {
            DeviceBuffer::F32(slice) => self
                .ctx
                .dev()
                .dtoh_sync_copy_into(slice, host)
                .map_err(|e| Error::Device(format!("download f32: {e}"))),
            DeviceBuffer::I32(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
        }
    }

    pub(crate) fn download_i32(&self, host: &mut [i32]) -> Result<()> {
        match &self.buf {
            DeviceBuffer::I32(slice) => self
                .ctx
                .dev()
                .dtoh_sync_copy_into(slice, host)
                .map_err(|e| Error::Device(format!("download i32: {e}"))),
            DeviceBuffer::F32(_) => Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: DType::F32,
            }),
        }
    }
}
