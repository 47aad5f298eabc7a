//! Flash decoding: one new query per request against its cached history.
//!
//! Histories are scattered through the cache arena and reached through the
//! request → cache-row table. Each (request, head) pair streams its history
//! in `decode_block_n` chunks through a single-row [`OnlineSoftmax`].

use kvflash_core::{KvError, Result, Tensor};
use rayon::prelude::*;
use tracing::trace;

use crate::context::DecodeBatch;
use crate::kv_cache::KvCache;
use crate::softmax::{OnlineSoftmax, SoftmaxScale};

/// `q` [batch, q_heads, d] → [batch, q_heads, d].
///
/// The current token's key/value must already be in `cache`, so the last
/// history row of each request is the token itself and no mask is needed.
pub fn flash_decoding(
    q: &Tensor,
    cache: &KvCache,
    batch: &DecodeBatch,
    decode_block_n: usize,
    scale: &SoftmaxScale,
) -> Result<Tensor> {
    if decode_block_n == 0 {
        return Err(KvError::InvalidConfig("decode_block_n must be non-zero".into()));
    }
    let qd = q.shape().expect_rank(3)?;
    let (requests, q_heads, d) = (qd[0], qd[1], qd[2]);
    if requests != batch.batch_size() {
        return Err(KvError::StepMismatch(format!(
            "decode query has {requests} rows for {} requests",
            batch.batch_size()
        )));
    }
    if d != cache.head_dim() {
        return Err(KvError::HeadDimMismatch {
            q: d,
            k: cache.head_dim(),
            v: cache.head_dim(),
        });
    }
    let kv_heads = cache.kv_heads();
    if q_heads % kv_heads != 0 {
        return Err(KvError::InvalidGrouping { q_heads, kv_heads });
    }
    let group = q_heads / kv_heads;

    batch.validate(cache.capacity())?;
    batch.check_written(cache, true)?;

    let dtype = cache.dtype();
    let qs = q.as_slice();
    trace!(units = requests * q_heads, block_n = decode_block_n, max_seq_len = batch.max_seq_len(), "decode kernel");

    let rows: Vec<Vec<f32>> = (0..requests * q_heads)
        .into_par_iter()
        .map(|unit| {
            let (b, h) = (unit / q_heads, unit % q_heads);
            let kvh = h / group;
            let q_row = &qs[unit * d..(unit + 1) * d];
            let history = batch.history(b);

            let mut state = OnlineSoftmax::new(1, d);
            let mut scores = Vec::with_capacity(decode_block_n);
            for chunk in history.chunks(decode_block_n) {
                scores.clear();
                scores.extend(chunk.iter().map(|&slot| {
                    let dot: f32 = q_row.iter().zip(cache.key_row(slot, kvh)).map(|(a, b)| a * b).sum();
                    dot * scale.qk_scale
                }));
                state.absorb(&scores, chunk.len(), scale, dtype, |c| cache.value_row(chunk[c], kvh));
            }
            state.finish()
        })
        .collect();

    Ok(Tensor::from_vec(rows.concat(), qd)?.to_dtype(q.dtype()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpBase;
    use crate::context::RowTable;
    use crate::kv_cache::concat_kv;
    use kvflash_core::DType;

    /// Cache with `n` random rows written at slots `base..base + n`.
    fn filled_cache(n: usize, base: usize, kv_heads: usize, d: usize, seed: u64) -> (KvCache, Tensor, Tensor) {
        let k = Tensor::randn_seeded(&[n, kv_heads, d], seed);
        let v = Tensor::randn_seeded(&[n, kv_heads, d], seed + 1);
        let mut cache = KvCache::new(base + n + 4, kv_heads, d, DType::F32);
        let slots: Vec<usize> = (base..base + n).collect();
        cache.write(&concat_kv(&k, &v).unwrap(), &slots).unwrap();
        (cache, k, v)
    }

    #[test]
    fn test_single_row_history_returns_value() {
        let (cache, _, v) = filled_cache(1, 2, 1, 4, 1);
        let q = Tensor::randn_seeded(&[1, 2, 4], 3);
        let batch = DecodeBatch::new(RowTable::from_requests(&[vec![2]]), vec![1]).unwrap();
        let scale = SoftmaxScale::new(4, None, ExpBase::Natural);
        let out = flash_decoding(&q, &cache, &batch, 8, &scale).unwrap();
        for h in 0..2 {
            assert_eq!(&out.as_slice()[h * 4..(h + 1) * 4], v.as_slice());
        }
    }

    #[test]
    fn test_matches_dense_softmax() {
        let (cache, k, v) = filled_cache(11, 0, 1, 4, 5);
        let q = Tensor::randn_seeded(&[1, 1, 4], 7);
        let batch = DecodeBatch::new(RowTable::from_requests(&[(0..11).collect()]), vec![11]).unwrap();
        let scale = SoftmaxScale::new(4, None, ExpBase::Base2);
        let out = flash_decoding(&q, &cache, &batch, 3, &scale).unwrap();

        let (qs, ks, vs) = (q.as_slice(), k.as_slice(), v.as_slice());
        let scores: Vec<f64> = (0..11)
            .map(|j| (0..4).map(|i| (qs[i] * ks[j * 4 + i]) as f64).sum::<f64>() * 0.5)
            .collect();
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
        for i in 0..4 {
            let expected: f64 = (0..11).map(|j| (scores[j] - max).exp() / sum * vs[j * 4 + i] as f64).sum();
            assert!((out.as_slice()[i] as f64 - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_scattered_history_follows_row_table() {
        let (cache, _, _) = filled_cache(6, 0, 1, 4, 9);
        let q = Tensor::randn_seeded(&[2, 1, 4], 11);
        let scale = SoftmaxScale::new(4, None, ExpBase::Natural);

        // Same rows, different table order: softmax is order-independent.
        let a = DecodeBatch::new(RowTable::from_requests(&[vec![0, 2, 4], vec![1, 3, 5]]), vec![3, 3]).unwrap();
        let b = DecodeBatch::new(RowTable::from_requests(&[vec![4, 0, 2], vec![5, 1, 3]]), vec![3, 3]).unwrap();
        let out_a = flash_decoding(&q, &cache, &a, 2, &scale).unwrap();
        let out_b = flash_decoding(&q, &cache, &b, 2, &scale).unwrap();
        assert!(out_a.max_abs_diff(&out_b).unwrap() < 1e-5);
    }

    #[test]
    fn test_unwritten_row_is_rejected() {
        let (cache, _, _) = filled_cache(2, 0, 1, 4, 13);
        let q = Tensor::randn_seeded(&[1, 1, 4], 15);
        let batch = DecodeBatch::new(RowTable::from_requests(&[vec![0, 1, 3]]), vec![3]).unwrap();
        let scale = SoftmaxScale::new(4, None, ExpBase::Natural);
        assert!(matches!(
            flash_decoding(&q, &cache, &batch, 4, &scale),
            Err(KvError::StepMismatch(_))
        ));
    }

    #[test]
    fn test_batch_size_mismatch() {
        let (cache, _, _) = filled_cache(2, 0, 1, 4, 17);
        let q = Tensor::randn_seeded(&[2, 1, 4], 19);
        let batch = DecodeBatch::new(RowTable::from_requests(&[vec![0, 1]]), vec![2]).unwrap();
        let scale = SoftmaxScale::new(4, None, ExpBase::Natural);
        assert!(flash_decoding(&q, &cache, &batch, 4, &scale).is_err());
    }
}
