//! Tiled prefill against the untiled `f64` reference.

mod common;

use common::assert_close;
use kvflash_attention::prefill::{context_attention, flash_attention_padded};
use kvflash_attention::reference::{reference_attention, reference_padded};
use kvflash_attention::{ExpBase, PrefillBatch, SoftmaxScale, TileConfig};
use kvflash_core::{DType, Tensor};

fn packed_qkv(lens: &[usize], q_heads: usize, kv_heads: usize, d: usize, seed: u64) -> (Tensor, Tensor, Tensor) {
    let t: usize = lens.iter().sum();
    (
        Tensor::randn_seeded(&[t, q_heads, d], seed),
        Tensor::randn_seeded(&[t, kv_heads, d], seed + 100),
        Tensor::randn_seeded(&[t, kv_heads, d], seed + 200),
    )
}

#[test]
fn test_prefill_matches_reference_across_tilings() {
    let lens = [37, 1, 64, 9];
    let (q, k, v) = packed_qkv(&lens, 4, 2, 16, 1);
    let batch = PrefillBatch::packed(lens.to_vec());
    let expected = reference_attention(&q, &k, &v, &batch, None).unwrap();

    for tiles in [TileConfig::new(16, 16, 16), TileConfig::new(32, 8, 8), TileConfig::new(128, 128, 64)] {
        for base in [ExpBase::Natural, ExpBase::Base2] {
            let scale = SoftmaxScale::new(16, None, base);
            let out = context_attention(&q, &k, &v, &batch, &tiles, &scale).unwrap();
            assert_close(out.as_slice(), expected.as_slice(), 1e-4);
        }
    }
}

#[test]
fn test_prefill_matches_reference_custom_scale() {
    let lens = [12, 20];
    let (q, k, v) = packed_qkv(&lens, 2, 2, 8, 2);
    let batch = PrefillBatch::packed(lens.to_vec());
    let scale = SoftmaxScale::new(8, Some(0.07), ExpBase::Base2);
    let out = context_attention(&q, &k, &v, &batch, &TileConfig::default(), &scale).unwrap();
    let expected = reference_attention(&q, &k, &v, &batch, Some(0.07)).unwrap();
    assert_close(out.as_slice(), expected.as_slice(), 1e-4);
}

#[test]
fn test_prefill_matches_reference_at_reduced_precision() {
    let lens = [21, 11];
    for dtype in [DType::F16, DType::BF16] {
        let (q, k, v) = packed_qkv(&lens, 4, 1, 8, 3);
        let (q, k, v) = (q.to_dtype(dtype), k.to_dtype(dtype), v.to_dtype(dtype));
        let batch = PrefillBatch::packed(lens.to_vec());
        let scale = SoftmaxScale::new(8, None, ExpBase::Base2);
        let out = context_attention(&q, &k, &v, &batch, &TileConfig::new(8, 8, 8), &scale).unwrap();
        let expected = reference_attention(&q, &k, &v, &batch, None).unwrap();
        let tol = if dtype == DType::F16 { 1e-2 } else { 5e-2 };
        assert_close(out.as_slice(), expected.as_slice(), tol);
    }
}

#[test]
fn test_non_contiguous_start_offsets() {
    // Request 1 is packed before request 0; token 4 belongs to nobody.
    let (q, k, v) = packed_qkv(&[10], 2, 1, 8, 4);
    let batch = PrefillBatch::with_start_loc(vec![5, 0], vec![5, 4]).unwrap();
    let scale = SoftmaxScale::new(8, None, ExpBase::Natural);
    let out = context_attention(&q, &k, &v, &batch, &TileConfig::new(4, 4, 4), &scale).unwrap();
    let expected = reference_attention(&q, &k, &v, &batch, None).unwrap();
    assert_close(out.as_slice(), expected.as_slice(), 1e-4);
    assert!(out.as_slice()[4 * 16..5 * 16].iter().all(|&x| x == 0.0));
}

#[test]
fn test_padded_kernel_matches_reference() {
    for (m, n) in [(1, 33), (8, 8), (5, 40)] {
        let q = Tensor::randn_seeded(&[2, 4, m, 8], 10);
        let k = Tensor::randn_seeded(&[2, 2, n, 8], 11);
        let v = Tensor::randn_seeded(&[2, 2, n, 8], 12);
        let scale = SoftmaxScale::new(8, None, ExpBase::Base2);
        let out = flash_attention_padded(&q, &k, &v, &TileConfig::new(4, 16, 16), &scale).unwrap();
        let expected = reference_padded(&q, &k, &v, None).unwrap();
        assert_eq!(out.dims(), q.dims());
        assert_close(out.as_slice(), expected.as_slice(), 1e-4);
    }
}
