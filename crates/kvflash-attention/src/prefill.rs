//! Tiled causal attention for prompt processing.
//!
//! Query rows are split into `block_m` tiles and keys into `block_n` tiles.
//! Each (request, head, row tile) is an independent unit of work with its
//! own [`OnlineSoftmax`] accumulator; units run in parallel with rayon and
//! their rows are scattered into the output afterwards.

use kvflash_core::{DType, KvError, Result, Tensor};
use rayon::prelude::*;
use tracing::trace;

use crate::config::TileConfig;
use crate::context::PrefillBatch;
use crate::mask::apply_causal;
use crate::softmax::{OnlineSoftmax, SoftmaxScale};

/// Geometry of one row tile.
#[derive(Clone, Copy)]
struct RowTile {
    /// Rows in the tile, including padding past the sequence end.
    rows: usize,
    /// Key position of the tile's first row; row `r` sees keys `0..=row_pos + r`.
    row_pos: usize,
    /// Keys available to the sequence.
    keys: usize,
    head_dim: usize,
    block_n: usize,
}

/// Run one row tile to completion.
///
/// `query(r)` is `None` for padding rows, which are computed on zeros and
/// dropped by the caller.
fn attend_tile<'a, Q, K, V>(
    tile: &RowTile,
    scale: &SoftmaxScale,
    dtype: DType,
    query: Q,
    key: K,
    value: V,
) -> Vec<f32>
where
    Q: Fn(usize) -> Option<&'a [f32]>,
    K: Fn(usize) -> &'a [f32],
    V: Fn(usize) -> &'a [f32],
{
    let RowTile { rows, row_pos, keys, head_dim, block_n } = *tile;
    let zeros = vec![0.0f32; head_dim];
    let q_rows: Vec<&[f32]> = (0..rows).map(|r| query(r).unwrap_or(&zeros[..])).collect();

    // Causal bound: no key past the tile's last row.
    let n_end = keys.min(row_pos + rows);

    let mut state = OnlineSoftmax::new(rows, head_dim);
    let mut scores = Vec::with_capacity(rows * block_n);
    for n_start in (0..n_end).step_by(block_n) {
        let cols = block_n.min(n_end - n_start);
        scores.clear();
        for q_row in &q_rows {
            for c in 0..cols {
                let k_row = key(n_start + c);
                let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum();
                scores.push(dot * scale.qk_scale);
            }
        }
        apply_causal(&mut scores, rows, cols, row_pos, n_start);
        state.absorb(&scores, cols, scale, dtype, |c| value(n_start + c));
    }
    state.finish()
}

struct Layout {
    q_heads: usize,
    kv_heads: usize,
    head_dim: usize,
    group: usize,
}

fn check_layout(q: &[usize], k: &[usize], v: &[usize], head_axis: usize) -> Result<Layout> {
    let d = q[q.len() - 1];
    let (kd, vd) = (k[k.len() - 1], v[v.len() - 1]);
    if kd != d || vd != d {
        return Err(KvError::HeadDimMismatch { q: d, k: kd, v: vd });
    }
    if k != v {
        return Err(KvError::ShapeMismatch {
            expected: k.to_vec(),
            got: v.to_vec(),
        });
    }
    let (q_heads, kv_heads) = (q[head_axis], k[head_axis]);
    if kv_heads == 0 || q_heads % kv_heads != 0 {
        return Err(KvError::InvalidGrouping { q_heads, kv_heads });
    }
    Ok(Layout {
        q_heads,
        kv_heads,
        head_dim: d,
        group: q_heads / kv_heads,
    })
}

/// Causal GQA attention over requests packed along the token axis.
///
/// `q` [tokens, q_heads, d], `k`/`v` [tokens, kv_heads, d]. Request `b`
/// occupies tokens `start_loc[b]..start_loc[b] + seq_lens[b]` and attends
/// only within itself. Returns [tokens, q_heads, d] in `q`'s dtype; rows
/// not covered by any request are zero.
pub fn context_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    batch: &PrefillBatch,
    tiles: &TileConfig,
    scale: &SoftmaxScale,
) -> Result<Tensor> {
    tiles.validate()?;
    let qd = q.shape().expect_rank(3)?;
    let kd = k.shape().expect_rank(3)?;
    let vd = v.shape().expect_rank(3)?;
    let layout = check_layout(qd, kd, vd, 1)?;
    let tokens = qd[0];
    if kd[0] != tokens {
        return Err(KvError::ShapeMismatch {
            expected: vec![tokens, layout.kv_heads, layout.head_dim],
            got: kd.to_vec(),
        });
    }
    batch.validate(tokens)?;

    let Layout { q_heads, kv_heads, head_dim: d, group } = layout;
    let block_m = tiles.block_m;
    let dtype = q.dtype();
    let (qs, ks, vs) = (q.as_slice(), k.as_slice(), v.as_slice());

    let (start_loc, seq_lens) = (batch.start_loc(), batch.seq_lens());

    // (request, head, row tile), covering each request's own length.
    let units: Vec<(usize, usize, usize)> = (0..batch.batch_size())
        .flat_map(|b| {
            let m_blocks = seq_lens[b].div_ceil(block_m);
            (0..q_heads).flat_map(move |h| (0..m_blocks).map(move |m| (b, h, m)))
        })
        .collect();
    trace!(units = units.len(), block_m, block_n = tiles.block_n, "prefill kernel");

    let results: Vec<((usize, usize, usize), Vec<f32>)> = units
        .into_par_iter()
        .map(|(b, h, m)| {
            let (start, len) = (start_loc[b], seq_lens[b]);
            let kvh = h / group;
            let m_start = m * block_m;
            let tile = RowTile {
                rows: block_m,
                row_pos: m_start,
                keys: len,
                head_dim: d,
                block_n: tiles.block_n,
            };
            let acc = attend_tile(
                &tile,
                scale,
                dtype,
                |r| {
                    let pos = m_start + r;
                    (pos < len).then(|| {
                        let at = ((start + pos) * q_heads + h) * d;
                        &qs[at..at + d]
                    })
                },
                |j| {
                    let at = ((start + j) * kv_heads + kvh) * d;
                    &ks[at..at + d]
                },
                |j| {
                    let at = ((start + j) * kv_heads + kvh) * d;
                    &vs[at..at + d]
                },
            );
            ((b, h, m), acc)
        })
        .collect();

    let mut out = vec![0.0f32; tokens * q_heads * d];
    for ((b, h, m), acc) in results {
        let (start, len) = (start_loc[b], seq_lens[b]);
        let m_start = m * block_m;
        // Rows past the sequence end are padding.
        let valid = block_m.min(len - m_start);
        for r in 0..valid {
            let at = ((start + m_start + r) * q_heads + h) * d;
            out[at..at + d].copy_from_slice(&acc[r * d..(r + 1) * d]);
        }
    }
    Ok(Tensor::from_vec(out, qd)?.to_dtype(dtype))
}

/// Tiled attention over a dense batch.
///
/// `q` [batch, q_heads, m, d], `k`/`v` [batch, kv_heads, n, d] with
/// `n >= m`. The queries are the last `m` positions of the key range, so
/// row `i` sees keys `0..=i + (n - m)`; a single query row sees every key.
pub fn flash_attention_padded(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    tiles: &TileConfig,
    scale: &SoftmaxScale,
) -> Result<Tensor> {
    tiles.validate()?;
    let qd = q.shape().expect_rank(4)?;
    let kd = k.shape().expect_rank(4)?;
    let vd = v.shape().expect_rank(4)?;
    let layout = check_layout(qd, kd, vd, 1)?;
    let (batch, m, n) = (qd[0], qd[2], kd[2]);
    if kd[0] != batch || n < m {
        return Err(KvError::ShapeMismatch {
            expected: vec![batch, layout.kv_heads, n.max(m), layout.head_dim],
            got: kd.to_vec(),
        });
    }

    let Layout { q_heads, kv_heads, head_dim: d, group } = layout;
    let block_m = tiles.block_m;
    let offset = n - m;
    let dtype = q.dtype();
    let (qs, ks, vs) = (q.as_slice(), k.as_slice(), v.as_slice());

    let units: Vec<(usize, usize, usize)> = (0..batch)
        .flat_map(|b| (0..q_heads).flat_map(move |h| (0..m.div_ceil(block_m)).map(move |t| (b, h, t))))
        .collect();
    trace!(units = units.len(), block_m, block_n = tiles.block_n, "padded prefill kernel");

    let results: Vec<((usize, usize, usize), Vec<f32>)> = units
        .into_par_iter()
        .map(|(b, h, t)| {
            let q_base = (b * q_heads + h) * m * d;
            let kv_base = (b * kv_heads + h / group) * n * d;
            let m_start = t * block_m;
            let tile = RowTile {
                rows: block_m,
                row_pos: m_start + offset,
                keys: n,
                head_dim: d,
                block_n: tiles.block_n,
            };
            let acc = attend_tile(
                &tile,
                scale,
                dtype,
                |r| {
                    let i = m_start + r;
                    (i < m).then(|| &qs[q_base + i * d..q_base + (i + 1) * d])
                },
                |j| &ks[kv_base + j * d..kv_base + (j + 1) * d],
                |j| &vs[kv_base + j * d..kv_base + (j + 1) * d],
            );
            ((b, h, t), acc)
        })
        .collect();

    let mut out = vec![0.0f32; qs.len()];
    for ((b, h, t), acc) in results {
        let q_base = (b * q_heads + h) * m * d;
        let m_start = t * block_m;
        let valid = block_m.min(m - m_start);
        let dst = q_base + m_start * d;
        out[dst..dst + valid * d].copy_from_slice(&acc[..valid * d]);
    }
    Ok(Tensor::from_vec(out, qd)?.to_dtype(dtype))
}
