//! Projection seam between the attention core and the surrounding block.
//!
//! Weight loading and quantization live outside this crate; the dispatcher
//! only needs something that maps hidden states to Q/K/V and attention
//! output back to hidden states.

use kvflash_core::{KvError, Result, Tensor};
use rayon::prelude::*;

use crate::config::AttentionConfig;

const PAR_THRESHOLD: usize = 8192;

/// Flat projection outputs: `q` [tokens, q_heads * d], `k`/`v` [tokens, kv_heads * d].
#[derive(Debug, Clone)]
pub struct QkvProjected {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
}

pub trait Projection: Send + Sync {
    /// `hidden` [tokens, hidden_size].
    fn project_qkv(&self, hidden: &Tensor) -> Result<QkvProjected>;

    /// `attn` [tokens, q_heads * d] → [tokens, hidden_size].
    fn project_output(&self, attn: &Tensor) -> Result<Tensor>;
}

/// `x` [m, k] @ `w` [k, n], row-parallel above [`PAR_THRESHOLD`] outputs.
fn matmul(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let xd = x.shape().expect_rank(2)?;
    let wd = w.shape().expect_rank(2)?;
    let (m, k, n) = (xd[0], xd[1], wd[1]);
    if wd[0] != k {
        return Err(KvError::ShapeMismatch {
            expected: vec![k, n],
            got: wd.to_vec(),
        });
    }
    let (xs, ws) = (x.as_slice(), w.as_slice());
    let row = |i: usize, out: &mut [f32]| {
        for (p, &a) in xs[i * k..(i + 1) * k].iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            for (o, &b) in out.iter_mut().zip(&ws[p * n..(p + 1) * n]) {
                *o += a * b;
            }
        }
    };

    let mut out = vec![0.0f32; m * n];
    if m * n >= PAR_THRESHOLD {
        out.par_chunks_mut(n).enumerate().for_each(|(i, o)| row(i, o));
    } else {
        out.chunks_mut(n).enumerate().for_each(|(i, o)| row(i, o));
    }
    Ok(Tensor::from_vec(out, &[m, n])?.to_dtype(x.dtype()))
}

/// Dense row-major weights, `x @ W`.
#[derive(Debug, Clone)]
pub struct DenseProjection {
    /// [hidden, q_heads * d]
    pub wq: Tensor,
    /// [hidden, kv_heads * d]
    pub wk: Tensor,
    /// [hidden, kv_heads * d]
    pub wv: Tensor,
    /// [q_heads * d, hidden]
    pub wo: Tensor,
}

impl DenseProjection {
    pub fn new(wq: Tensor, wk: Tensor, wv: Tensor, wo: Tensor) -> Result<Self> {
        let hidden = wq.shape().expect_rank(2)?[0];
        let q_width = wq.dims()[1];
        for w in [&wk, &wv] {
            if w.ndim() != 2 || w.dims()[0] != hidden {
                return Err(KvError::ShapeMismatch {
                    expected: vec![hidden, 0],
                    got: w.dims().to_vec(),
                });
            }
        }
        if wo.dims() != [q_width, hidden] {
            return Err(KvError::ShapeMismatch {
                expected: vec![q_width, hidden],
                got: wo.dims().to_vec(),
            });
        }
        Ok(Self { wq, wk, wv, wo })
    }

    /// Random weights scaled by `1 / sqrt(hidden)`, reproducible from `seed`.
    pub fn seeded(config: &AttentionConfig, seed: u64) -> Result<Self> {
        let hidden = config.hidden_size;
        let (qw, kvw) = (config.q_width(), config.kv_width());
        let scale = 1.0 / (hidden as f32).sqrt();
        let random = |rows: usize, cols: usize, s: u64| -> Result<Tensor> {
            let t = Tensor::randn_seeded(&[rows, cols], s);
            let data = t.as_slice().iter().map(|x| x * scale).collect();
            Ok(Tensor::from_vec(data, &[rows, cols])?.to_dtype(config.dtype))
        };
        Self::new(
            random(hidden, qw, seed)?,
            random(hidden, kvw, seed.wrapping_add(1))?,
            random(hidden, kvw, seed.wrapping_add(2))?,
            random(qw, hidden, seed.wrapping_add(3))?,
        )
    }
}

impl Projection for DenseProjection {
    fn project_qkv(&self, hidden: &Tensor) -> Result<QkvProjected> {
        Ok(QkvProjected {
            q: matmul(hidden, &self.wq)?,
            k: matmul(hidden, &self.wk)?,
            v: matmul(hidden, &self.wv)?,
        })
    }

    fn project_output(&self, attn: &Tensor) -> Result<Tensor> {
        matmul(attn, &self.wo)
    }
}
