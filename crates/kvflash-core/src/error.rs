//! Error taxonomy for the attention core.
//!
//! Every variant except `NumericDivergence` is a precondition violation:
//! the caller broke a contract and the operation must not be retried.

use crate::dtype::DType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KvError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("head dimension mismatch: q={q}, k={k}, v={v}")]
    HeadDimMismatch { q: usize, k: usize, v: usize },

    #[error("rotary table width {table} does not match head_dim {head_dim}")]
    RotaryDimMismatch { table: usize, head_dim: usize },

    #[error("{what} index {index} out of bounds (bound {bound})")]
    IndexOutOfBounds {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("cache slot {slot} written twice in one call")]
    DuplicateSlot { slot: usize },

    #[error("query heads ({q_heads}) not divisible by kv heads ({kv_heads})")]
    InvalidGrouping { q_heads: usize, kv_heads: usize },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("step context mismatch: {0}")]
    StepMismatch(String),

    #[error("{count} non-finite values survived sanitization at layer {layer}")]
    NumericDivergence { layer: usize, count: usize },
}

impl KvError {
    /// Caller contract breach; never retried.
    pub fn is_precondition(&self) -> bool {
        !self.is_numeric()
    }

    /// Non-finite values that could not be sanitized.
    pub fn is_numeric(&self) -> bool {
        matches!(self, KvError::NumericDivergence { .. })
    }

    /// Layer that diverged, if this is a numeric failure.
    pub fn layer(&self) -> Option<usize> {
        match self {
            KvError::NumericDivergence { layer, .. } => Some(*layer),
            _ => None,
        }
    }
}
