//! Attention configuration.
//!
//! Read-only for the lifetime of a loaded model. Accepts the field names of a
//! HuggingFace `config.json` so the same file can be handed straight through.

use std::path::Path;

use kvflash_core::{DType, KvError, Result};
use serde::{Deserialize, Serialize};

/// Exponent base used by the softmax in both kernels.
///
/// `Base2` folds `log2(e)` into the logit scale and evaluates `exp2`; the
/// result is mathematically identical to `Natural`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpBase {
    #[default]
    Natural,
    Base2,
}

/// Tile sizes for the two kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    /// Query rows per prefill work unit.
    pub block_m: usize,
    /// Key/value rows per prefill column tile.
    pub block_n: usize,
    /// Cached rows per decode history tile.
    pub decode_block_n: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_m: 32,
            block_n: 32,
            decode_block_n: 64,
        }
    }
}

impl TileConfig {
    pub fn new(block_m: usize, block_n: usize, decode_block_n: usize) -> Self {
        Self { block_m, block_n, decode_block_n }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_m == 0 || self.block_n == 0 || self.decode_block_n == 0 {
            return Err(KvError::InvalidConfig(format!(
                "tile sizes must be non-zero, got {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Candidate grid searched by the autotuner.
    pub fn candidates() -> Vec<TileConfig> {
        const SIZES: [usize; 4] = [16, 32, 64, 128];
        let mut out = Vec::with_capacity(SIZES.len() * SIZES.len());
        for &block_m in &SIZES {
            for &block_n in &SIZES {
                out.push(TileConfig { block_m, block_n, decode_block_n: block_n });
            }
        }
        out
    }
}

fn default_max_tokens() -> usize {
    4096
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

fn default_nan_sentinel() -> f32 {
    1e-8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    #[serde(alias = "num_hidden_layers", alias = "n_layers")]
    pub num_layers: usize,
    #[serde(alias = "num_attention_heads", alias = "n_heads")]
    pub num_heads: usize,
    /// Defaults to `num_heads` (plain multi-head attention).
    #[serde(default, alias = "num_key_value_heads", alias = "n_kv_heads")]
    pub num_kv_heads: Option<usize>,
    #[serde(alias = "d_model")]
    pub hidden_size: usize,
    /// Defaults to `hidden_size / num_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    /// Carried for the normalization collaborator; unused here.
    #[serde(default = "default_rms_norm_eps", alias = "norm_eps")]
    pub rms_norm_eps: f32,
    /// Cache rows per layer.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default, alias = "torch_dtype", deserialize_with = "deserialize_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub tiles: TileConfig,
    #[serde(default)]
    pub exp_base: ExpBase,
    #[serde(default = "default_nan_sentinel")]
    pub nan_sentinel: f32,
}

fn deserialize_dtype<'de, D>(deserializer: D) -> std::result::Result<DType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    DType::from_name(&name)
        .ok_or_else(|| serde::de::Error::custom(format!("unsupported dtype '{name}'")))
}

impl AttentionConfig {
    /// Minimal config for a model; everything else takes its default.
    pub fn new(num_layers: usize, num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_layers,
            num_heads,
            num_kv_heads: Some(num_kv_heads),
            hidden_size: num_heads * head_dim,
            head_dim: Some(head_dim),
            rms_norm_eps: default_rms_norm_eps(),
            max_tokens: default_max_tokens(),
            dtype: DType::F32,
            tiles: TileConfig::default(),
            exp_base: ExpBase::Natural,
            nan_sentinel: default_nan_sentinel(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    pub fn with_exp_base(mut self, exp_base: ExpBase) -> Self {
        self.exp_base = exp_base;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_nan_sentinel(mut self, sentinel: f32) -> Self {
        self.nan_sentinel = sentinel;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AttentionConfig = serde_json::from_str(json)
            .map_err(|e| KvError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KvError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&data)
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_size / self.num_heads.max(1))
    }

    /// Query heads sharing each key/value head.
    pub fn group_factor(&self) -> usize {
        self.num_heads / self.kv_heads().max(1)
    }

    /// Width of a query row: `num_heads * head_dim`.
    pub fn q_width(&self) -> usize {
        self.num_heads * self.head_dim()
    }

    pub fn kv_width(&self) -> usize {
        self.kv_heads() * self.head_dim()
    }

    pub fn validate(&self) -> Result<()> {
        let kv_heads = self.kv_heads();
        let head_dim = self.head_dim();
        if self.num_layers == 0 || self.num_heads == 0 || kv_heads == 0 || head_dim == 0 {
            return Err(KvError::InvalidConfig(format!(
                "layers, heads and head_dim must be non-zero (layers={}, heads={}, kv_heads={}, head_dim={})",
                self.num_layers, self.num_heads, kv_heads, head_dim
            )));
        }
        if self.num_heads % kv_heads != 0 {
            return Err(KvError::InvalidGrouping {
                q_heads: self.num_heads,
                kv_heads,
            });
        }
        if head_dim % 2 != 0 {
            return Err(KvError::InvalidConfig(format!(
                "head_dim must be even for rotary pairs, got {head_dim}"
            )));
        }
        if self.num_heads * head_dim != self.hidden_size {
            return Err(KvError::InvalidConfig(format!(
                "num_heads * head_dim = {} but hidden_size = {}",
                self.num_heads * head_dim,
                self.hidden_size
            )));
        }
        if self.max_tokens == 0 {
            return Err(KvError::InvalidConfig("max_tokens must be non-zero".into()));
        }
        self.tiles.validate()
    }
}
