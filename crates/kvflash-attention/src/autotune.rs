//! Empirical tile-size selection.
//!
//! Tile sizes only affect speed, so the tuner just times each candidate on a
//! caller-supplied problem and keeps the fastest.

use std::time::Instant;

use kvflash_core::{KvError, Result, Tensor};
use tracing::info;

use crate::config::TileConfig;
use crate::context::{DecodeBatch, PrefillBatch};
use crate::decode::flash_decoding;
use crate::kv_cache::KvCache;
use crate::prefill::context_attention;
use crate::softmax::SoftmaxScale;

/// Fastest candidate and its mean time per run, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneResult {
    pub tiles: TileConfig,
    pub seconds: f64,
}

fn time_it<F: FnMut() -> Result<()>>(iters: usize, mut f: F) -> Result<f64> {
    // Warmup
    f()?;
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters.max(1) as f64)
}

fn pick<F>(candidates: &[TileConfig], iters: usize, mut run: F) -> Result<TuneResult>
where
    F: FnMut(&TileConfig) -> Result<()>,
{
    let mut best: Option<TuneResult> = None;
    for tiles in candidates {
        tiles.validate()?;
        let seconds = time_it(iters, || run(tiles))?;
        if best.map_or(true, |b| seconds < b.seconds) {
            best = Some(TuneResult { tiles: *tiles, seconds });
        }
    }
    best.ok_or_else(|| KvError::InvalidConfig("no tile candidates".into()))
}

/// Time prefill `block_m`/`block_n` candidates.
pub fn tune_prefill(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    batch: &PrefillBatch,
    scale: &SoftmaxScale,
    candidates: &[TileConfig],
    iters: usize,
) -> Result<TuneResult> {
    let best = pick(candidates, iters, |tiles| {
        context_attention(q, k, v, batch, tiles, scale).map(|_| ())
    })?;
    info!(
        block_m = best.tiles.block_m,
        block_n = best.tiles.block_n,
        "prefill autotune: {:.3}ms",
        best.seconds * 1000.0
    );
    Ok(best)
}

/// Time decode `decode_block_n` candidates.
pub fn tune_decode(
    q: &Tensor,
    cache: &KvCache,
    batch: &DecodeBatch,
    scale: &SoftmaxScale,
    candidates: &[TileConfig],
    iters: usize,
) -> Result<TuneResult> {
    let best = pick(candidates, iters, |tiles| {
        flash_decoding(q, cache, batch, tiles.decode_block_n, scale).map(|_| ())
    })?;
    info!(
        decode_block_n = best.tiles.decode_block_n,
        "decode autotune: {:.3}ms",
        best.seconds * 1000.0
    );
    Ok(best)
}
