use tracing::debug;

use crate::device::DeviceContext;

/// Which engine a module computes on.
///
/// A closed choice made once per module at construction and stored —
/// the per-call "is this the CPU sentinel?" branching lives here and
/// nowhere else. The CPU variant computes synchronously inside the
/// layer's forward; the device variant goes through kernel handles with
/// their stage/run phases.
#[derive(Clone, Debug)]
pub enum ComputeBackend {
    Cpu,
    Device(DeviceContext),
}

impl ComputeBackend {
    /// Probe for GPU 0 and fall back to the CPU when the driver, the
    /// hardware, or the kernel compilation is unavailable.
    pub fn auto() -> Self {
        match DeviceContext::new(0) {
            Ok(ctx) => ComputeBackend::Device(ctx),
            Err(e) => {
                debug!(error = %e, "no usable device, using CPU backend");
                ComputeBackend::Cpu
            }
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, ComputeBackend::Device(_))
    }

    /// The device context, when this is the device variant.
    pub fn device(&self) -> Option<&DeviceContext> {
        match self {
            ComputeBackend::Device(ctx) => Some(ctx),
            ComputeBackend::Cpu => None,
        }
    }
}
