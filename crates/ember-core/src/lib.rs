//! Ember compute core.
//!
//! The pieces every layer is a thin consumer of:
//!
//! - [`Tensor`] — a dual-residency buffer: host and device copies with
//!   authority flags, reconciled lazily, with an optional in-flight task
//!   handle joined by every accessor.
//! - [`Parameter`] — a tensor plus optimizer scratch and an [`Init`] rule.
//! - kernel handles ([`kernel`]) — opaque device operations with a
//!   two-phase stage/run contract and CPU reference implementations.
//! - [`Lowering`] — the vol2col / col2vol transform turning convolution
//!   and pooling into GEMM and scattering gradients back.
//! - [`Session`] — the explicit context holding the shared worker pool
//!   and the arena-indexed module graph.
//! - [`ComputeBackend`] — the closed CPU-or-device choice made once per
//!   module.

pub mod backend;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod kernels;
pub mod lowering;
pub mod parameter;
pub mod pool;
pub mod session;
pub mod shape;
pub mod tensor;

pub use backend::ComputeBackend;
pub use device::DeviceContext;
pub use dtype::DType;
pub use error::{Error, Result};
pub use lowering::{dim_fix, Lowering, MAX_DIMS};
pub use parameter::{Init, Parameter};
pub use pool::{TaskHandle, WorkerPool};
pub use session::{NodeId, Session, StepRecord};
pub use shape::Shape;
pub use tensor::{Tensor, TensorId};
