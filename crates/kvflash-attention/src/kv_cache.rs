//! Slot-addressed KV cache.
//!
//! Each layer owns one fixed-capacity row store of shape
//! [capacity, 2 * kv_heads, head_dim]: heads `0..kv_heads` of a row hold the
//! key, heads `kv_heads..2 * kv_heads` hold the value. Rows are written by
//! slot index and never shifted or compacted; which slot belongs to which
//! (request, position) is decided by the caller.

use kvflash_core::{DType, KvError, Result, Tensor};

/// Key/value row store for a single attention layer.
pub struct KvCache {
    /// [capacity, 2 * kv_heads, head_dim]
    data: Vec<f32>,
    /// Rows currently owned by a live request.
    occupied: Vec<bool>,
    occupied_count: usize,
    capacity: usize,
    kv_heads: usize,
    head_dim: usize,
    dtype: DType,
}

impl KvCache {
    /// Allocate the full store up front; it is never reallocated.
    pub fn new(capacity: usize, kv_heads: usize, head_dim: usize, dtype: DType) -> Self {
        Self {
            data: vec![0.0; capacity * 2 * kv_heads * head_dim],
            occupied: vec![false; capacity],
            occupied_count: 0,
            capacity,
            kv_heads,
            head_dim,
            dtype,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kv_heads(&self) -> usize {
        self.kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Footprint of the store in the working precision.
    pub fn bytes(&self) -> usize {
        self.data.len() * self.dtype.element_size()
    }

    /// Number of rows written and not yet released.
    pub fn occupied_rows(&self) -> usize {
        self.occupied_count
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        self.occupied.get(slot).copied().unwrap_or(false)
    }

    fn row_width(&self) -> usize {
        2 * self.kv_heads * self.head_dim
    }

    /// Scatter `combined_kv` ([tokens, 2 * kv_heads, head_dim]) into the rows
    /// named by `slots`, one slot per token.
    ///
    /// All indices are checked before any row is touched, so a failed call
    /// leaves the cache unchanged.
    pub fn write(&mut self, combined_kv: &Tensor, slots: &[usize]) -> Result<()> {
        let expected = [slots.len(), 2 * self.kv_heads, self.head_dim];
        if combined_kv.dims() != expected {
            return Err(KvError::ShapeMismatch {
                expected: expected.to_vec(),
                got: combined_kv.dims().to_vec(),
            });
        }
        if combined_kv.dtype() != self.dtype {
            return Err(KvError::DTypeMismatch {
                expected: self.dtype,
                got: combined_kv.dtype(),
            });
        }
        self.check_slots(slots)?;

        let width = self.row_width();
        let src = combined_kv.as_slice();
        for (t, &slot) in slots.iter().enumerate() {
            self.data[slot * width..(slot + 1) * width]
                .copy_from_slice(&src[t * width..(t + 1) * width]);
            if !self.occupied[slot] {
                self.occupied[slot] = true;
                self.occupied_count += 1;
            }
        }
        Ok(())
    }

    fn check_slots(&self, slots: &[usize]) -> Result<()> {
        let mut seen = vec![false; self.capacity];
        for &slot in slots {
            if slot >= self.capacity {
                return Err(KvError::IndexOutOfBounds {
                    what: "cache slot",
                    index: slot,
                    bound: self.capacity,
                });
            }
            if std::mem::replace(&mut seen[slot], true) {
                return Err(KvError::DuplicateSlot { slot });
            }
        }
        Ok(())
    }

    /// Mark rows free once their request has finished. Data is left in place.
    pub fn release(&mut self, slots: &[usize]) -> Result<()> {
        for &slot in slots {
            if slot >= self.capacity {
                return Err(KvError::IndexOutOfBounds {
                    what: "cache slot",
                    index: slot,
                    bound: self.capacity,
                });
            }
        }
        for &slot in slots {
            if std::mem::replace(&mut self.occupied[slot], false) {
                self.occupied_count -= 1;
            }
        }
        Ok(())
    }

    /// Full row for `slot`: keys then values, [2 * kv_heads * head_dim].
    pub fn row(&self, slot: usize) -> Option<&[f32]> {
        let width = self.row_width();
        self.data.get(slot * width..(slot + 1) * width)
    }

    /// Key vector of `kv_head` at `slot`. `slot` must be < capacity.
    #[inline]
    pub fn key_row(&self, slot: usize, kv_head: usize) -> &[f32] {
        let start = (slot * 2 * self.kv_heads + kv_head) * self.head_dim;
        &self.data[start..start + self.head_dim]
    }

    /// Value vector of `kv_head` at `slot`. `slot` must be < capacity.
    #[inline]
    pub fn value_row(&self, slot: usize, kv_head: usize) -> &[f32] {
        let start = (slot * 2 * self.kv_heads + self.kv_heads + kv_head) * self.head_dim;
        &self.data[start..start + self.head_dim]
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("capacity", &self.capacity)
            .field("kv_heads", &self.kv_heads)
            .field("head_dim", &self.head_dim)
            .field("dtype", &self.dtype)
            .field("occupied", &self.occupied_count)
            .finish()
    }
}

/// Join per-token keys and values along the head axis.
///
/// `k`, `v`: [tokens, kv_heads, head_dim] → [tokens, 2 * kv_heads, head_dim].
pub fn concat_kv(k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let kd = k.shape().expect_rank(3)?;
    if v.dims() != kd {
        return Err(KvError::ShapeMismatch {
            expected: kd.to_vec(),
            got: v.dims().to_vec(),
        });
    }
    if k.dtype() != v.dtype() {
        return Err(KvError::DTypeMismatch {
            expected: k.dtype(),
            got: v.dtype(),
        });
    }
    let (tokens, heads, d) = (kd[0], kd[1], kd[2]);
    let width = heads * d;
    let (ks, vs) = (k.as_slice(), v.as_slice());

    let mut out = Vec::with_capacity(tokens * 2 * width);
    for t in 0..tokens {
        out.extend_from_slice(&ks[t * width..(t + 1) * width]);
        out.extend_from_slice(&vs[t * width..(t + 1) * width]);
    }
    Ok(Tensor::from_vec(out, &[tokens, 2 * heads, d])?.to_dtype(k.dtype()))
}
