//! Rotary position embedding application.
//!
//! Rotates query/key head vectors using precomputed per-position cos/sin
//! tables. Table construction belongs to the caller; only the rotation is
//! done here, just before keys are written to the cache.

use kvflash_core::{KvError, Result, Tensor};

/// Per-step cos/sin tables, each [batch or 1, seq_len, head_dim].
///
/// Tables carry the full head width: entries `i` and `i + head_dim / 2`
/// belong to the same rotation pair.
#[derive(Debug, Clone)]
pub struct PositionTables {
    pub cos: Tensor,
    pub sin: Tensor,
}

impl PositionTables {
    pub fn new(cos: Tensor, sin: Tensor) -> Result<Self> {
        if cos.dims() != sin.dims() {
            return Err(KvError::ShapeMismatch {
                expected: cos.dims().to_vec(),
                got: sin.dims().to_vec(),
            });
        }
        Ok(Self { cos, sin })
    }

    /// (batch, seq_len, width), promoting a 2-D table to batch 1.
    fn extents(&self) -> Result<(usize, usize, usize)> {
        match *self.cos.dims() {
            [s, w] => Ok((1, s, w)),
            [b, s, w] => Ok((b, s, w)),
            _ => Err(KvError::ShapeMismatch {
                expected: vec![0, 0, 0],
                got: self.cos.dims().to_vec(),
            }),
        }
    }
}

/// Rotate `q` [tokens, q_heads, head_dim] and `k` [tokens, kv_heads, head_dim].
///
/// Token `t` takes its position row from `(t / seq_len, t % seq_len)`, so
/// `tokens` must equal `batch * seq_len`. Returns new tensors with the same
/// shape and dtype.
pub fn apply(q: &Tensor, k: &Tensor, tables: &PositionTables, batch: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
    let qd = q.shape().expect_rank(3)?;
    let kd = k.shape().expect_rank(3)?;
    let (tokens, head_dim) = (qd[0], qd[2]);

    if kd[0] != tokens || kd[2] != head_dim {
        return Err(KvError::ShapeMismatch {
            expected: vec![tokens, kd[1], head_dim],
            got: kd.to_vec(),
        });
    }
    if tokens != batch * seq_len {
        return Err(KvError::ShapeMismatch {
            expected: vec![batch * seq_len, qd[1], head_dim],
            got: qd.to_vec(),
        });
    }

    let (table_batch, table_seq, width) = tables.extents()?;
    if width != head_dim {
        return Err(KvError::RotaryDimMismatch { table: width, head_dim });
    }
    if head_dim % 2 != 0 {
        return Err(KvError::RotaryDimMismatch { table: width, head_dim });
    }
    if table_seq != seq_len || (table_batch != 1 && table_batch != batch) {
        return Err(KvError::ShapeMismatch {
            expected: vec![batch, seq_len, head_dim],
            got: tables.cos.dims().to_vec(),
        });
    }

    let row_of = |t: usize| {
        let b = if table_batch == 1 { 0 } else { t / seq_len };
        (b * seq_len + t % seq_len) * head_dim
    };

    let rotate = |x: &Tensor| -> Result<Tensor> {
        let heads = x.dims()[1];
        let mut out = x.as_slice().to_vec();
        let (cos, sin) = (tables.cos.as_slice(), tables.sin.as_slice());
        for t in 0..tokens {
            let r = row_of(t);
            let (c, s) = (&cos[r..r + head_dim], &sin[r..r + head_dim]);
            for h in 0..heads {
                let start = (t * heads + h) * head_dim;
                rotate_half(&mut out[start..start + head_dim], c, s);
            }
        }
        Ok(Tensor::from_vec(out, x.dims())?.to_dtype(x.dtype()))
    };

    Ok((rotate(q)?, rotate(k)?))
}

/// x' = x * cos + rotate_half(x) * sin, where rotate_half(x) = [-x2, x1].
#[inline]
fn rotate_half(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    let half = x.len() / 2;
    for i in 0..half {
        let x0 = x[i];
        let x1 = x[i + half];
        x[i] = x0 * cos[i] - x1 * sin[i];
        x[i + half] = x1 * cos[i + half] + x0 * sin[i + half];
    }
}
