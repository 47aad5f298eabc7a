//! Online (streaming) softmax shared by the prefill and decode kernels.
//!
//! A row's softmax over the key axis is built one column tile at a time.
//! After every tile the accumulator holds the attention output over the
//! columns seen so far, already normalized, so the final tile needs no
//! extra division.

use kvflash_core::DType;

use crate::config::ExpBase;

/// Logit scale plus exponent convention, resolved once per forward call.
///
/// Both kernels take this same value, so prefill and decode always agree on
/// whether `log2(e)` is folded into the scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftmaxScale {
    /// Multiplier applied to raw `q · k` (includes `log2(e)` for `Base2`).
    pub qk_scale: f32,
    pub base: ExpBase,
}

impl SoftmaxScale {
    /// `scale` defaults to `1 / sqrt(head_dim)`.
    pub fn new(head_dim: usize, scale: Option<f32>, base: ExpBase) -> Self {
        let sm_scale = scale.unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());
        let qk_scale = match base {
            ExpBase::Natural => sm_scale,
            ExpBase::Base2 => sm_scale * std::f32::consts::LOG2_E,
        };
        Self { qk_scale, base }
    }

    #[inline]
    pub fn exp(&self, x: f32) -> f32 {
        match self.base {
            ExpBase::Natural => x.exp(),
            ExpBase::Base2 => x.exp2(),
        }
    }
}

/// Running state for a tile of query rows.
pub struct OnlineSoftmax {
    rows: usize,
    head_dim: usize,
    /// Running maximum logit per row.
    max: Vec<f32>,
    /// Running normalizer per row.
    denom: Vec<f32>,
    /// [rows, head_dim], normalized by `denom` at every tile boundary.
    acc: Vec<f32>,
    numerators: Vec<f32>,
}

impl OnlineSoftmax {
    pub fn new(rows: usize, head_dim: usize) -> Self {
        Self {
            rows,
            head_dim,
            max: vec![f32::NEG_INFINITY; rows],
            denom: vec![0.0; rows],
            acc: vec![0.0; rows * head_dim],
            numerators: Vec::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Merge one column tile.
    ///
    /// `scores` is [rows, cols] of scaled, already-masked logits. `value(c)`
    /// returns the value row for tile column `c`. Probabilities are rounded
    /// to `dtype` before the value product.
    pub fn absorb<'v, F>(
        &mut self,
        scores: &[f32],
        cols: usize,
        scale: &SoftmaxScale,
        dtype: DType,
        value: F,
    ) where
        F: Fn(usize) -> &'v [f32],
    {
        debug_assert_eq!(scores.len(), self.rows * cols);
        let d = self.head_dim;
        self.numerators.resize(cols, 0.0);

        for r in 0..self.rows {
            let row = &scores[r * cols..(r + 1) * cols];

            let local_max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut local_sum = 0.0f32;
            for (n, &s) in self.numerators.iter_mut().zip(row) {
                *n = scale.exp(s - local_max);
                local_sum += *n;
            }

            let prev_max = self.max[r];
            let new_max = prev_max.max(local_max);
            let alpha = scale.exp(prev_max - new_max);
            let beta = scale.exp(local_max - new_max);
            let new_denom = alpha * self.denom[r] + beta * local_sum;

            let p_scale = beta / new_denom;
            let sigma = self.denom[r] / new_denom * alpha;

            let acc = &mut self.acc[r * d..(r + 1) * d];
            for a in acc.iter_mut() {
                *a *= sigma;
            }
            for (c, &n) in self.numerators.iter().enumerate() {
                let p = dtype.round(n * p_scale);
                if p == 0.0 {
                    continue;
                }
                for (a, &v) in acc.iter_mut().zip(value(c)) {
                    *a += p * v;
                }
            }

            self.max[r] = new_max;
            self.denom[r] = new_denom;
        }
    }

    /// Normalized output rows, [rows, head_dim].
    pub fn finish(self) -> Vec<f32> {
        self.acc
    }
}
