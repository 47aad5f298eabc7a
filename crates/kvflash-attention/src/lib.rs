//! # kvflash-attention
//!
//! Attention execution core for decoder-only inference.
//!
//! Provides:
//! - Per-layer KV cache arena addressed by slot index
//! - Rotary position embedding application
//! - Tiled causal prefill over packed variable-length sequences
//! - Flash decoding against scattered per-request histories
//! - A per-layer dispatcher driven by an explicit step tag
//! - Numeric guard, tile autotuning and an `f64` reference

pub mod autotune;
pub mod config;
pub mod context;
pub mod decode;
pub mod dispatcher;
pub mod guard;
pub mod kv_cache;
pub mod mask;
pub mod prefill;
pub mod projection;
pub mod reference;
pub mod rotary;
pub mod softmax;

pub use config::{AttentionConfig, ExpBase, TileConfig};
pub use context::{AttentionContext, DecodeBatch, PrefillBatch, RowTable, StepKind};
pub use dispatcher::AttentionDispatcher;
pub use guard::NumericGuard;
pub use kv_cache::KvCache;
pub use projection::{DenseProjection, Projection, QkvProjected};
pub use rotary::PositionTables;
pub use softmax::SoftmaxScale;
