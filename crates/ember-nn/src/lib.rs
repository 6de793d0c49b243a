//! Ember neural-network layers.
//!
//! Every layer owns a [`ModuleCore`](module::ModuleCore) — its session
//! handle, its backend chosen once at construction, its parameter cache,
//! its asynchronously staged argument stores, and its lazily
//! shape-registered output — and implements [`Module`](module::Module):
//! `forward` over input tensors, `backward` returning the gradient with
//! respect to the first staged input.

pub mod activation;
pub mod conv;
pub mod flatten;
pub mod init;
pub mod linear;
pub mod loss;
pub mod module;
pub mod norm;
pub mod pooling;
pub mod sequential;

pub use activation::Activation;
pub use conv::ConvNd;
pub use flatten::Flatten;
pub use linear::Linear;
pub use loss::{CrossEntropyLoss, MseLoss, Reduction};
pub use module::{ArgTicket, Module, ModuleCore};
pub use norm::BatchNorm;
pub use pooling::MaxPoolNd;
pub use sequential::Sequential;
