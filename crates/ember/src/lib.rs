//! Ember — a small deep-learning training framework.
//!
//! Tensors are dual-residency buffers: host and device copies with
//! authority flags, reconciled lazily, with in-flight asynchronous
//! operations joined at every accessor. Layers are modules over a shared
//! session; convolution and pooling are lowered to GEMM with
//! vol2col/col2vol; device work goes through two-phase (stage/run)
//! kernel handles with CPU reference implementations.
//!
//! ```no_run
//! use ember::prelude::*;
//!
//! # fn run() -> Result<()> {
//! let session = Session::new();
//! let backend = ComputeBackend::auto();
//! let mut model = Sequential::new(&session, &backend)
//!     .push(Linear::new(&session, &backend, 2, 8, true)?)
//!     .push(Activation::tanh(&session, &backend))
//!     .push(Linear::new(&session, &backend, 8, 1, true)?);
//! let mut loss = MseLoss::new(&session, &backend, Reduction::Mean);
//! let mut opt = Sgd::new(&session, &backend, model.parameters(), 0.1, 0.9, 0.0, 0.0, false)?;
//!
//! let x = Tensor::from_vec(vec![0.0, 1.0], (1, 2))?;
//! let t = Tensor::from_vec(vec![1.0], (1, 1))?;
//! for _ in 0..100 {
//!     opt.zero_grad()?;
//!     let y = model.call(&x)?;
//!     let l = loss.forward(&[&y, &t])?;
//!     loss.backward()?; // writes the gradient of the model output
//!     model.backward()?;
//!     opt.step()?;
//!     let _ = l.to_vec_f32()?;
//! }
//! # Ok(())
//! # }
//! ```

pub use ember_core::{
    dim_fix, ComputeBackend, DType, DeviceContext, Error, Init, Lowering, NodeId, Parameter,
    Result, Session, Shape, StepRecord, TaskHandle, Tensor, TensorId, WorkerPool, MAX_DIMS,
};

pub use ember_core::kernel;

pub use ember_nn::{
    Activation, ArgTicket, BatchNorm, ConvNd, CrossEntropyLoss, Flatten, Linear, MaxPoolNd,
    Module, ModuleCore, MseLoss, Reduction, Sequential,
};

pub use ember_optim::{Adam, Optimizer, RmsProp, Sgd};

/// Everything a training script usually imports.
pub mod prelude {
    pub use ember_core::{ComputeBackend, Init, Parameter, Result, Session, Tensor};
    pub use ember_nn::{
        Activation, BatchNorm, ConvNd, CrossEntropyLoss, Flatten, Linear, MaxPoolNd, Module,
        MseLoss, Reduction, Sequential,
    };
    pub use ember_optim::{Adam, Optimizer, RmsProp, Sgd};
}
