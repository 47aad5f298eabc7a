//! Untiled attention with `f64` accumulation.
//!
//! Materializes the full score matrix per (request, head). Slow and
//! memory-hungry, used only to validate the tiled kernels.

use kvflash_core::{KvError, Result, Tensor};

use crate::context::PrefillBatch;
use crate::mask::causal_mask;

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// Softmax-weighted sum of `values` under additive `bias` (0 or -inf).
fn attend_row(q: &[f32], keys: &[&[f32]], values: &[&[f32]], bias: &[f32], scale: f64, out: &mut [f32]) {
    let scores: Vec<f64> = keys
        .iter()
        .zip(bias)
        .map(|(k, &b)| dot(q, k) * scale + b as f64)
        .collect();
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = weights.iter().sum();

    let mut acc = vec![0.0f64; out.len()];
    for (w, v) in weights.iter().zip(values) {
        for (a, &x) in acc.iter_mut().zip(v.iter()) {
            *a += w / sum * x as f64;
        }
    }
    for (o, a) in out.iter_mut().zip(acc) {
        *o = a as f32;
    }
}

fn check_heads(q_heads: usize, kv_heads: usize) -> Result<usize> {
    if kv_heads == 0 || q_heads % kv_heads != 0 {
        return Err(KvError::InvalidGrouping { q_heads, kv_heads });
    }
    Ok(q_heads / kv_heads)
}

/// Causal GQA attention over packed sequences.
///
/// `q` [tokens, q_heads, d], `k`/`v` [tokens, kv_heads, d]. `scale`
/// defaults to `1 / sqrt(d)`.
pub fn reference_attention(q: &Tensor, k: &Tensor, v: &Tensor, batch: &PrefillBatch, scale: Option<f32>) -> Result<Tensor> {
    let qd = q.shape().expect_rank(3)?;
    let kd = k.shape().expect_rank(3)?;
    let (tokens, q_heads, d) = (qd[0], qd[1], qd[2]);
    let kv_heads = kd[1];
    if kd[2] != d || v.dims() != kd {
        return Err(KvError::HeadDimMismatch { q: d, k: kd[2], v: v.dims().last().copied().unwrap_or(0) });
    }
    let group = check_heads(q_heads, kv_heads)?;
    batch.validate(tokens)?;
    let scale = scale.unwrap_or_else(|| 1.0 / (d as f32).sqrt()) as f64;

    let (qs, ks, vs) = (q.as_slice(), k.as_slice(), v.as_slice());
    let q_at = |t: usize, h: usize| &qs[(t * q_heads + h) * d..(t * q_heads + h + 1) * d];
    let kv_at = |t: usize, h: usize| (t * kv_heads + h) * d..(t * kv_heads + h + 1) * d;

    let mut out = vec![0.0f32; tokens * q_heads * d];
    for (&start, &len) in batch.start_loc().iter().zip(batch.seq_lens()) {
        let mask = causal_mask(len);
        for h in 0..q_heads {
            let kvh = h / group;
            let keys: Vec<&[f32]> = (0..len).map(|j| &ks[kv_at(start + j, kvh)]).collect();
            let values: Vec<&[f32]> = (0..len).map(|j| &vs[kv_at(start + j, kvh)]).collect();
            for i in 0..len {
                let t = start + i;
                let o = (t * q_heads + h) * d;
                attend_row(q_at(t, h), &keys, &values, &mask[i * len..(i + 1) * len], scale, &mut out[o..o + d]);
            }
        }
    }
    Tensor::from_vec(out, qd)
}

/// Dense-batch counterpart: `q` [b, q_heads, m, d], `k`/`v` [b, kv_heads, n, d].
///
/// Query row `i` sees keys `0..=i + (n - m)`.
pub fn reference_padded(q: &Tensor, k: &Tensor, v: &Tensor, scale: Option<f32>) -> Result<Tensor> {
    let qd = q.shape().expect_rank(4)?;
    let kd = k.shape().expect_rank(4)?;
    let (b, q_heads, m, d) = (qd[0], qd[1], qd[2], qd[3]);
    let (kv_heads, n) = (kd[1], kd[2]);
    if kd[3] != d || v.dims() != kd || kd[0] != b || n < m {
        return Err(KvError::ShapeMismatch {
            expected: vec![b, kv_heads, n.max(m), d],
            got: kd.to_vec(),
        });
    }
    let group = check_heads(q_heads, kv_heads)?;
    let scale = scale.unwrap_or_else(|| 1.0 / (d as f32).sqrt()) as f64;
    let offset = n - m;

    let (qs, ks, vs) = (q.as_slice(), k.as_slice(), v.as_slice());
    let mut out = vec![0.0f32; qs.len()];
    for bi in 0..b {
        for h in 0..q_heads {
            let kv_base = (bi * kv_heads + h / group) * n * d;
            let keys: Vec<&[f32]> = (0..n).map(|j| &ks[kv_base + j * d..kv_base + (j + 1) * d]).collect();
            let values: Vec<&[f32]> = (0..n).map(|j| &vs[kv_base + j * d..kv_base + (j + 1) * d]).collect();
            for i in 0..m {
                let bias: Vec<f32> = (0..n)
                    .map(|j| if j <= i + offset { 0.0 } else { f32::NEG_INFINITY })
                    .collect();
                let row = ((bi * q_heads + h) * m + i) * d;
                attend_row(&qs[row..row + d], &keys, &values, &bias, scale, &mut out[row..row + d]);
            }
        }
    }
    Tensor::from_vec(out, qd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_token_copies_its_value() {
        let q = Tensor::randn_seeded(&[3, 2, 4], 1);
        let k = Tensor::randn_seeded(&[3, 1, 4], 2);
        let v = Tensor::randn_seeded(&[3, 1, 4], 3);
        let out = reference_attention(&q, &k, &v, &PrefillBatch::packed(vec![3]), None).unwrap();
        // Position 0 attends only to itself.
        for h in 0..2 {
            assert_eq!(&out.as_slice()[h * 4..(h + 1) * 4], &v.as_slice()[..4]);
        }
    }

    #[test]
    fn test_requests_are_independent() {
        let q = Tensor::randn_seeded(&[5, 1, 4], 4);
        let k = Tensor::randn_seeded(&[5, 1, 4], 5);
        let v = Tensor::randn_seeded(&[5, 1, 4], 6);
        let packed = reference_attention(&q, &k, &v, &PrefillBatch::packed(vec![2, 3]), None).unwrap();

        let tail = |t: &Tensor| Tensor::from_f32(&t.as_slice()[8..], &[3, 1, 4]).unwrap();
        let alone = reference_attention(&tail(&q), &tail(&k), &tail(&v), &PrefillBatch::packed(vec![3]), None).unwrap();
        assert_eq!(&packed.as_slice()[8..], alone.as_slice());
    }

    #[test]
    fn test_padded_single_query_sees_all_keys() {
        let q = Tensor::randn_seeded(&[1, 1, 1, 4], 7);
        let k = Tensor::from_vec(vec![0.0; 12], &[1, 1, 3, 4]).unwrap();
        let v = Tensor::from_vec((0..12).map(|i| (i / 4) as f32).collect(), &[1, 1, 3, 4]).unwrap();
        let out = reference_padded(&q, &k, &v, None).unwrap();
        // Zero keys give uniform weights: mean of 0, 1, 2.
        for &x in out.as_slice() {
            assert!((x - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_bad_grouping() {
        let q = Tensor::randn_seeded(&[2, 3, 4], 8);
        let k = Tensor::randn_seeded(&[2, 2, 4], 9);
        let err = reference_attention(&q, &k, &k, &PrefillBatch::packed(vec![2]), None).unwrap_err();
        assert_eq!(err, KvError::InvalidGrouping { q_heads: 3, kv_heads: 2 });
    }
}
