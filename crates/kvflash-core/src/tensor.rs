use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::DType;
use crate::error::KvError;
use crate::shape::Shape;
use crate::Result;

/// A dense, row-major tensor.
///
/// Storage is `f32` behind an `Arc`, so clones are cheap and mutation is
/// copy-on-write. The dtype tag is the working precision: every value held
/// by a reduced-precision tensor is representable in that format.
///
/// # Examples
///
/// ```
/// use kvflash_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// assert_eq!(t.dims(), &[2, 2]);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create an f32 tensor by copying `data`.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Create an f32 tensor taking ownership of `data`.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(KvError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self {
            data: Arc::new(data),
            shape: s,
            dtype: DType::F32,
        })
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self {
            data: Arc::new(vec![0.0; s.numel()]),
            shape: s,
            dtype,
        }
    }

    /// Standard-normal values from a seeded generator (Box-Muller).
    pub fn randn_seeded(shape: &[usize], seed: u64) -> Self {
        let s = Shape::new(shape);
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..s.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self {
            data: Arc::new(data),
            shape: s,
            dtype: DType::F32,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access; clones the storage if it is shared.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Whether every element is finite.
    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Largest absolute elementwise difference; shapes must match.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.dims() != other.dims() {
            return Err(KvError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: other.dims().to_vec(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// Reshape without copying; at most one dimension may be -1.
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self
            .shape
            .resolve_reshape(new_shape)
            .ok_or_else(|| KvError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            })?;
        Ok(Tensor {
            data: Arc::clone(&self.data),
            shape: resolved,
            dtype: self.dtype,
        })
    }

    /// Round into another working precision.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype || !dtype.is_reduced() {
            return Tensor {
                data: Arc::clone(&self.data),
                shape: self.shape.clone(),
                dtype,
            };
        }
        let mut data = self.data.as_ref().clone();
        dtype.round_slice(&mut data);
        Tensor {
            data: Arc::new(data),
            shape: self.shape.clone(),
            dtype,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={}, dtype={})", self.shape, self.dtype)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.as_slice();
        if data.len() <= 20 {
            write!(f, "tensor({:?}, shape={})", data, self.shape)
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape
            )
        }
    }
}
