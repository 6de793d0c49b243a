//! Ember optimizers.
//!
//! `step()` submits one update task per parameter to the session's
//! worker pool and attaches the returned handle to the parameter's
//! tensor — any later accessor (the next forward pass, a checkpoint
//! read) joins the in-flight update first. The update tasks themselves
//! use the tensor's non-joining host access: they *are* the pending
//! operation they would otherwise be waiting on.
//!
//! Each optimizer ships the CPU formulas and a device step kernel
//! computing the same update; which one a task runs is decided by the
//! backend the optimizer was built with.

mod adam;
mod rmsprop;
mod sgd;

pub use adam::Adam;
pub use rmsprop::RmsProp;
pub use sgd::Sgd;

use ember_core::{Parameter, Result};

/// The interface shared by every optimizer.
pub trait Optimizer {
    /// Queue one asynchronous update per parameter.
    fn step(&mut self) -> Result<()>;

    /// The parameters this optimizer drives.
    fn params(&self) -> &[Parameter];

    /// Zero every parameter gradient (no-op for gradients never used).
    fn zero_grad(&self) -> Result<()> {
        for p in self.params() {
            p.zero_grad()?;
        }
        Ok(())
    }
}
