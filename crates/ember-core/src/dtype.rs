/// Element types a tensor can hold.
///
/// The type is fixed when the tensor is constructed and never changes;
/// every host↔device copy of a buffer is lossless. Wider host types are
/// narrowed *before* construction by the caller (the framework itself
/// only ever moves `f32` and `i32` across residencies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    /// 32-bit IEEE float. The working type for all numeric computation.
    F32,
    /// 32-bit signed integer. Labels, indices.
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::I32 => write!(f, "i32"),
        }
    }
}
