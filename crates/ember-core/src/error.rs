use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Ember.
///
/// One enum across the whole framework: shape and size mismatches,
/// unsupported layer configurations, unimplemented code paths, device
/// failures, and failures that happened inside a queued task.
///
/// The type is `Clone` on purpose: a failure raised inside a worker task
/// is stored in the task's handle and surfaces at every join of that
/// handle, which may be far from the call that queued the work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Element count mismatch when building a tensor from a flat buffer.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// DType mismatch between a tensor and the access or operation applied to it.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// A class label outside [0, label_count) was fed to `onehot`.
    #[error("label {value} out of range for {label_count} classes")]
    InvalidLabel { value: i64, label_count: usize },

    /// A configuration the framework rejects at construction time
    /// (e.g. grouped convolution, a non-"zeros" padding mode).
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// A code path that has no real implementation yet.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// Gradient requested on a tensor that does not track one.
    #[error("gradient requested on a tensor that does not track one")]
    NoGradient,

    /// `run()` called on a kernel handle before `stage()`.
    #[error("kernel `{0}` run before arguments were staged")]
    KernelNotStaged(&'static str),

    /// CUDA driver, NVRTC, or cuBLAS failure.
    #[error("device error: {0}")]
    Device(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Ember.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
