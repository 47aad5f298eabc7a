//! # kvflash-core
//!
//! Tensor primitives shared by the kvflash attention crates.
//!
//! Provides:
//! - `Tensor`: row-major, reference-counted `f32` storage tagged with a
//!   working precision
//! - `Shape` with stack-allocated dims for the common rank ≤ 4 case
//! - `DType` working precisions (F32, F16, BF16)
//! - `KvError`, the error type every fallible operation returns

pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;
pub mod prelude;

pub use dtype::DType;
pub use error::KvError;
pub use shape::Shape;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, KvError>;
