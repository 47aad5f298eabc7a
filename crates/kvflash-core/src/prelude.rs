//! Convenience re-exports for common kvflash-core types.
//!
//! ```rust
//! use kvflash_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::KvError;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
