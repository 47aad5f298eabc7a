use smallvec::SmallVec;
use std::fmt;

use crate::error::KvError;
use crate::Result;

/// Tensor shape with stack-allocated storage for ≤4 dimensions.
///
/// Attention tensors are at most rank 4 ([batch, heads, seq, head_dim]),
/// so the common case never touches the heap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (1 for a rank-0 shape).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Size of the innermost dimension, or 1 for rank 0.
    pub fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    /// Fail with `ShapeMismatch` unless the rank is `ndim`.
    pub fn expect_rank(&self, ndim: usize) -> Result<&[usize]> {
        if self.ndim() != ndim {
            return Err(KvError::ShapeMismatch {
                expected: vec![0; ndim],
                got: self.dims.to_vec(),
            });
        }
        Ok(&self.dims)
    }

    /// Resolve a reshape target; at most one dimension may be -1.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred = None;
        let mut known: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(i),
                d if d > 0 => known = known.checked_mul(d as usize)?,
                _ => return None,
            }
        }

        let mut dims: SmallVec<[usize; 4]> = target.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(idx) = inferred {
            if known == 0 || numel % known != 0 {
                return None;
            }
            dims[idx] = numel / known;
        }

        let shape = Shape { dims };
        (shape.numel() == numel).then_some(shape)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(1, 2, 3, 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(&[8, 4, 16]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 512);
        assert_eq!(s.dim(1), Some(4));
        assert_eq!(s.dim(3), None);
        assert_eq!(s.last_dim(), 16);
    }

    #[test]
    fn test_expect_rank() {
        let s = Shape::new(&[5, 2, 8]);
        assert_eq!(s.expect_rank(3).unwrap(), &[5, 2, 8]);
        assert!(matches!(s.expect_rank(2), Err(KvError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_reshape() {
        let s = Shape::new(&[6, 4, 8]);
        assert_eq!(s.resolve_reshape(&[6, 32]).unwrap().dims(), &[6, 32]);
        assert_eq!(s.resolve_reshape(&[-1, 8]).unwrap().dims(), &[24, 8]);
        assert!(s.resolve_reshape(&[-1, -1]).is_none());
        assert!(s.resolve_reshape(&[5, 5]).is_none());
        assert!(s.resolve_reshape(&[0, 8]).is_none());
    }

    #[test]
    fn test_from_array() {
        let s: Shape = [2, 4, 8].into();
        assert_eq!(s.dims(), &[2, 4, 8]);
    }
}
