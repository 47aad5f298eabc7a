//! Per-layer attention forward pass.
//!
//! Projects hidden states, rotates Q/K, writes K/V into the layer's cache,
//! runs the kernel selected by the step tag, projects back and runs the
//! numeric guard.

use kvflash_core::{KvError, Result, Tensor};
use tracing::debug;

use crate::config::AttentionConfig;
use crate::context::{AttentionContext, StepKind};
use crate::decode::flash_decoding;
use crate::guard::NumericGuard;
use crate::kv_cache::concat_kv;
use crate::prefill::context_attention;
use crate::projection::{DenseProjection, Projection};
use crate::rotary::{self, PositionTables};
use crate::softmax::SoftmaxScale;

pub struct AttentionDispatcher {
    config: AttentionConfig,
    guard: NumericGuard,
    projections: Vec<Box<dyn Projection>>,
}

impl AttentionDispatcher {
    /// One projection per layer.
    pub fn new(config: AttentionConfig, projections: Vec<Box<dyn Projection>>) -> Result<Self> {
        config.validate()?;
        if projections.len() != config.num_layers {
            return Err(KvError::InvalidConfig(format!(
                "{} projections for {} layers",
                projections.len(),
                config.num_layers
            )));
        }
        let guard = NumericGuard::new(config.nan_sentinel);
        Ok(Self { config, guard, projections })
    }

    /// Random dense projections, layer `l` seeded with `seed + l`.
    pub fn seeded(config: AttentionConfig, seed: u64) -> Result<Self> {
        let projections = (0..config.num_layers)
            .map(|l| {
                DenseProjection::seeded(&config, seed.wrapping_add(l as u64))
                    .map(|p| Box::new(p) as Box<dyn Projection>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(config, projections)
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Run attention for `layer` over this step's tokens.
    ///
    /// `hidden` is [tokens, hidden_size] or [batch, seq, hidden_size] with
    /// `batch * seq` equal to the step's token count. The output has the
    /// same shape. Extends the layer's cache by exactly the step's tokens.
    /// `scale` defaults to `1 / sqrt(head_dim)`.
    ///
    /// Prefill `tables` are indexed per packed token and must be
    /// [1, tokens, head_dim] (or [tokens, head_dim]), even when every prompt
    /// has the same length. Decode `tables` hold one position per request,
    /// [batch, 1, head_dim].
    ///
    /// A decode step whose history reads a row this layer never wrote is
    /// rejected before the cache is touched.
    pub fn forward(
        &self,
        hidden: &Tensor,
        ctx: &mut AttentionContext,
        layer: usize,
        tables: &PositionTables,
        scale: Option<f32>,
    ) -> Result<Tensor> {
        let projection = self.projections.get(layer).ok_or(KvError::IndexOutOfBounds {
            what: "layer",
            index: layer,
            bound: self.projections.len(),
        })?;

        let cfg = &self.config;
        let (q_heads, kv_heads, d) = (cfg.num_heads, cfg.kv_heads(), cfg.head_dim());
        if hidden.ndim() < 2 || hidden.shape().last_dim() != cfg.hidden_size {
            return Err(KvError::ShapeMismatch {
                expected: vec![0, cfg.hidden_size],
                got: hidden.dims().to_vec(),
            });
        }
        let tokens = hidden.numel() / cfg.hidden_size;

        let (kind, rot_batch, rot_seq) = {
            let step = ctx.step()?;
            if step.num_tokens() != tokens {
                return Err(KvError::StepMismatch(format!(
                    "{} step expects {} tokens, got {tokens}",
                    step.name(),
                    step.num_tokens()
                )));
            }
            // Prefill tables are per packed token; decode tables per request.
            match step {
                StepKind::Prefill(_) => (step.name(), 1, tokens),
                StepKind::Decode(_) => (step.name(), tokens, 1),
            }
        };
        debug!(layer, step = kind, tokens, "attention forward");

        let flat = hidden.to_dtype(cfg.dtype).reshape(&[tokens as isize, cfg.hidden_size as isize])?;
        let qkv = projection.project_qkv(&flat)?;
        let q = qkv.q.reshape(&[tokens as isize, q_heads as isize, d as isize])?;
        let k = qkv.k.reshape(&[tokens as isize, kv_heads as isize, d as isize])?;
        let v = qkv.v.reshape(&[tokens as isize, kv_heads as isize, d as isize])?;

        let (q, k) = rotary::apply(&q, &k, tables, rot_batch, rot_seq)?;
        if let StepKind::Decode(batch) = ctx.step()? {
            batch.check_written(ctx.cache(layer)?, false)?;
        }
        ctx.write(layer, &concat_kv(&k, &v)?)?;

        let scale = SoftmaxScale::new(d, scale, cfg.exp_base);
        let attn = match ctx.step()? {
            // Prefill attends over the freshly packed tokens only.
            StepKind::Prefill(batch) => context_attention(&q, &k, &v, batch, &cfg.tiles, &scale)?,
            StepKind::Decode(batch) => {
                flash_decoding(&q, ctx.cache(layer)?, batch, cfg.tiles.decode_block_n, &scale)?
            }
        };

        let attn = attn.reshape(&[tokens as isize, cfg.q_width() as isize])?;
        let mut out = projection.project_output(&attn)?;
        self.guard.sanitize_and_verify(&mut out, layer)?;

        let shape: Vec<isize> = hidden.dims().iter().map(|&x| x as isize).collect();
        out.reshape(&shape)
    }
}
