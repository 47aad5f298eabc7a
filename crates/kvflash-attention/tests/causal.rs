//! Outputs never depend on later positions.

mod common;

use common::{init_tracing, rope_tables, SlotBook};
use kvflash_attention::prefill::context_attention;
use kvflash_attention::{
    AttentionConfig, AttentionContext, AttentionDispatcher, ExpBase, PrefillBatch, SoftmaxScale, TileConfig,
};
use kvflash_core::Tensor;

/// Add `delta` to every element of token `t`.
fn perturb(x: &Tensor, t: usize, delta: f32) -> Tensor {
    let width = x.numel() / x.dims()[0];
    let mut y = x.clone();
    for e in &mut y.as_mut_slice()[t * width..(t + 1) * width] {
        *e += delta;
    }
    y
}

#[test]
fn test_future_key_and_value_do_not_leak() {
    let (len, heads, d) = (40, 2, 8);
    let q = Tensor::randn_seeded(&[len, heads, d], 1);
    let k = Tensor::randn_seeded(&[len, heads, d], 2);
    let v = Tensor::randn_seeded(&[len, heads, d], 3);
    let batch = PrefillBatch::packed(vec![len]);
    let scale = SoftmaxScale::new(d, None, ExpBase::Base2);
    let tiles = TileConfig::new(16, 8, 8);
    let base = context_attention(&q, &k, &v, &batch, &tiles, &scale).unwrap();

    // Position 20 sits inside the row tile 16..32 and column tile 16..24.
    let target = 20;
    let k2 = perturb(&k, target, 5.0);
    let v2 = perturb(&v, target, 100.0);
    let out = context_attention(&q, &k2, &v2, &batch, &tiles, &scale).unwrap();

    let row = heads * d;
    assert_eq!(&out.as_slice()[..target * row], &base.as_slice()[..target * row]);
    assert_ne!(&out.as_slice()[target * row..(target + 1) * row], &base.as_slice()[target * row..(target + 1) * row]);
}

#[test]
fn test_other_requests_do_not_leak() {
    let q = Tensor::randn_seeded(&[12, 1, 4], 4);
    let k = Tensor::randn_seeded(&[12, 1, 4], 5);
    let v = Tensor::randn_seeded(&[12, 1, 4], 6);
    let batch = PrefillBatch::packed(vec![7, 5]);
    let scale = SoftmaxScale::new(4, None, ExpBase::Natural);
    let tiles = TileConfig::new(4, 4, 4);
    let base = context_attention(&q, &k, &v, &batch, &tiles, &scale).unwrap();

    // Request 1's first token must not change request 0 at all.
    let out = context_attention(&q, &perturb(&k, 7, 3.0), &perturb(&v, 7, 3.0), &batch, &tiles, &scale).unwrap();
    assert_eq!(&out.as_slice()[..7 * 4], &base.as_slice()[..7 * 4]);
}

#[test]
fn test_future_hidden_state_through_dispatcher() {
    init_tracing();
    let config = AttentionConfig::new(1, 4, 2, 8).with_tiles(TileConfig::new(4, 4, 4));
    let dispatcher = AttentionDispatcher::seeded(config.clone(), 1).unwrap();
    let hidden = Tensor::randn_seeded(&[9, 32], 2);

    let run = |hidden: &Tensor| {
        let mut ctx = AttentionContext::new(&config).unwrap();
        let plan = SlotBook::sequential(config.max_tokens).prefill(&[9]);
        ctx.begin_step(plan.step, plan.slots).unwrap();
        dispatcher
            .forward(hidden, &mut ctx, 0, &rope_tables(&plan.positions, 8), None)
            .unwrap()
    };
    let base = run(&hidden);
    let out = run(&perturb(&hidden, 6, 1.0));
    assert_eq!(&out.as_slice()[..6 * 32], &base.as_slice()[..6 * 32]);
}
