//! Per-step attention context.
//!
//! Holds the per-layer caches, which persist for the whole generation run,
//! and the description of the current step, which the slot-assignment
//! collaborator replaces before every forward pass.

use kvflash_core::{KvError, Result, Tensor};
use tracing::info;

use crate::config::AttentionConfig;
use crate::kv_cache::KvCache;

/// Requests whose prompts are packed back to back along the token axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefillBatch {
    /// Offset of each request's first token in the packed buffer.
    start_loc: Vec<usize>,
    seq_lens: Vec<usize>,
    max_seq_len: usize,
}

impl PrefillBatch {
    /// Contiguous packing: request `b` starts where `b - 1` ends.
    pub fn packed(seq_lens: Vec<usize>) -> Self {
        let mut start_loc = Vec::with_capacity(seq_lens.len());
        let mut offset = 0;
        for &len in &seq_lens {
            start_loc.push(offset);
            offset += len;
        }
        let max_seq_len = seq_lens.iter().copied().max().unwrap_or(0);
        Self { start_loc, seq_lens, max_seq_len }
    }

    pub fn with_start_loc(start_loc: Vec<usize>, seq_lens: Vec<usize>) -> Result<Self> {
        if start_loc.len() != seq_lens.len() {
            return Err(KvError::StepMismatch(format!(
                "{} start offsets for {} requests",
                start_loc.len(),
                seq_lens.len()
            )));
        }
        let max_seq_len = seq_lens.iter().copied().max().unwrap_or(0);
        Ok(Self { start_loc, seq_lens, max_seq_len })
    }

    pub fn start_loc(&self) -> &[usize] {
        &self.start_loc
    }

    pub fn seq_lens(&self) -> &[usize] {
        &self.seq_lens
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.seq_lens.iter().sum()
    }

    /// Every request must be non-empty and lie inside the packed buffer of
    /// `tokens` rows, and no two requests may share a token.
    ///
    /// With `tokens == num_tokens()` this means the requests tile the
    /// buffer exactly.
    pub fn validate(&self, tokens: usize) -> Result<()> {
        if self.start_loc.len() != self.seq_lens.len() {
            return Err(KvError::StepMismatch(format!(
                "{} start offsets for {} requests",
                self.start_loc.len(),
                self.seq_lens.len()
            )));
        }
        for (b, (&start, &len)) in self.start_loc.iter().zip(&self.seq_lens).enumerate() {
            if len == 0 {
                return Err(KvError::StepMismatch(format!("request {b} has no tokens")));
            }
            if start + len > tokens {
                return Err(KvError::IndexOutOfBounds {
                    what: "packed token",
                    index: start + len - 1,
                    bound: tokens,
                });
            }
        }

        let mut ranges: Vec<(usize, usize, usize)> = self
            .start_loc
            .iter()
            .zip(&self.seq_lens)
            .enumerate()
            .map(|(b, (&start, &len))| (start, start + len, b))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            let ((_, end, a), (start, _, b)) = (pair[0], pair[1]);
            if start < end {
                return Err(KvError::StepMismatch(format!(
                    "requests {a} and {b} overlap at packed token {start}"
                )));
            }
        }
        Ok(())
    }
}

/// Request → cache-row table, [batch, width], row-major.
///
/// Entry (b, i) is the cache slot holding position `i` of request `b`.
/// Only the first `seq_lens[b]` entries of a row are meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTable {
    rows: Vec<usize>,
    width: usize,
}

impl RowTable {
    pub fn new(rows: Vec<usize>, width: usize) -> Result<Self> {
        if width == 0 || rows.len() % width != 0 {
            return Err(KvError::ShapeMismatch {
                expected: vec![0, width],
                got: vec![rows.len()],
            });
        }
        Ok(Self { rows, width })
    }

    /// Build from ragged per-request slot lists, padding with slot 0.
    pub fn from_requests(requests: &[Vec<usize>]) -> Self {
        let width = requests.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let mut rows = vec![0; requests.len() * width];
        for (b, slots) in requests.iter().enumerate() {
            rows[b * width..b * width + slots.len()].copy_from_slice(slots);
        }
        Self { rows, width }
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len() / self.width
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Slots of request `b`, truncated to `len`.
    pub fn request(&self, b: usize, len: usize) -> &[usize] {
        &self.rows[b * self.width..b * self.width + len]
    }
}

/// One new token per request, attending to its full cached history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeBatch {
    req_to_rows: RowTable,
    /// History length per request, including the token being decoded.
    seq_lens: Vec<usize>,
    max_seq_len: usize,
}

impl DecodeBatch {
    pub fn new(req_to_rows: RowTable, seq_lens: Vec<usize>) -> Result<Self> {
        check_lengths(&req_to_rows, &seq_lens)?;
        let max_seq_len = seq_lens.iter().copied().max().unwrap_or(0);
        Ok(Self { req_to_rows, seq_lens, max_seq_len })
    }

    pub fn req_to_rows(&self) -> &RowTable {
        &self.req_to_rows
    }

    pub fn seq_lens(&self) -> &[usize] {
        &self.seq_lens
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.batch_size()
    }

    /// Cache rows of request `b`, oldest first; the last one is the token
    /// being decoded.
    pub fn history(&self, b: usize) -> &[usize] {
        self.req_to_rows.request(b, self.seq_lens[b])
    }

    /// All referenced slots must exist in a cache of `capacity` rows.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        check_lengths(&self.req_to_rows, &self.seq_lens)?;
        for b in 0..self.batch_size() {
            for &slot in self.history(b) {
                if slot >= capacity {
                    return Err(KvError::IndexOutOfBounds {
                        what: "cache slot",
                        index: slot,
                        bound: capacity,
                    });
                }
            }
        }
        Ok(())
    }

    /// Every history row must already hold keys and values in `cache`.
    ///
    /// With `include_current` false the newest row of each request is
    /// skipped, since the step itself is about to write it.
    pub fn check_written(&self, cache: &KvCache, include_current: bool) -> Result<()> {
        for b in 0..self.batch_size() {
            let history = self.history(b);
            let history = if include_current { history } else { &history[..history.len() - 1] };
            if let Some(&slot) = history.iter().find(|&&s| !cache.is_occupied(s)) {
                return Err(KvError::StepMismatch(format!("request {b} reads unwritten cache row {slot}")));
            }
        }
        Ok(())
    }
}

fn check_lengths(req_to_rows: &RowTable, seq_lens: &[usize]) -> Result<()> {
    if req_to_rows.batch_size() != seq_lens.len() {
        return Err(KvError::StepMismatch(format!(
            "row table has {} requests, seq_lens has {}",
            req_to_rows.batch_size(),
            seq_lens.len()
        )));
    }
    for (b, &len) in seq_lens.iter().enumerate() {
        if len == 0 || len > req_to_rows.width() {
            return Err(KvError::StepMismatch(format!(
                "request {b} length {len} outside row table width {}",
                req_to_rows.width()
            )));
        }
    }
    Ok(())
}

/// Which kernel a step runs. Chosen by the caller, never inferred from shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Prefill(PrefillBatch),
    Decode(DecodeBatch),
}

impl StepKind {
    pub fn num_tokens(&self) -> usize {
        match self {
            StepKind::Prefill(p) => p.num_tokens(),
            StepKind::Decode(d) => d.num_tokens(),
        }
    }

    pub fn max_seq_len(&self) -> usize {
        match self {
            StepKind::Prefill(p) => p.max_seq_len(),
            StepKind::Decode(d) => d.max_seq_len(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Prefill(_) => "prefill",
            StepKind::Decode(_) => "decode",
        }
    }
}

pub struct AttentionContext {
    caches: Vec<KvCache>,
    /// Cache row for each token of the current step.
    slot_index: Vec<usize>,
    step: Option<StepKind>,
}

impl AttentionContext {
    /// Allocate one cache per layer.
    pub fn new(config: &AttentionConfig) -> Result<Self> {
        config.validate()?;
        let caches: Vec<KvCache> = (0..config.num_layers)
            .map(|_| KvCache::new(config.max_tokens, config.kv_heads(), config.head_dim(), config.dtype))
            .collect();
        let total: usize = caches.iter().map(KvCache::bytes).sum();
        info!(
            layers = config.num_layers,
            rows = config.max_tokens,
            "allocated KV cache arena: {:.2} MB",
            total as f64 / 1e6
        );
        Ok(Self {
            caches,
            slot_index: Vec::new(),
            step: None,
        })
    }

    /// Install the description of the next step.
    ///
    /// A prefill's requests must tile the packed tokens exactly. A decode
    /// step's new token for request `b` must land on the newest row of that
    /// request's history.
    pub fn begin_step(&mut self, step: StepKind, slot_index: Vec<usize>) -> Result<()> {
        if slot_index.len() != step.num_tokens() {
            return Err(KvError::StepMismatch(format!(
                "{} slots for a {} step of {} tokens",
                slot_index.len(),
                step.name(),
                step.num_tokens()
            )));
        }
        let capacity = self.capacity();
        match &step {
            StepKind::Prefill(p) => p.validate(slot_index.len())?,
            StepKind::Decode(d) => {
                d.validate(capacity)?;
                for (b, &slot) in slot_index.iter().enumerate() {
                    let newest = d.history(b).last().copied();
                    if newest != Some(slot) {
                        return Err(KvError::StepMismatch(format!(
                            "request {b} writes row {slot} but its newest history row is {newest:?}"
                        )));
                    }
                }
            }
        }
        self.step = Some(step);
        self.slot_index = slot_index;
        Ok(())
    }

    pub fn step(&self) -> Result<&StepKind> {
        self.step
            .as_ref()
            .ok_or_else(|| KvError::StepMismatch("no step installed".into()))
    }

    pub fn slot_index(&self) -> &[usize] {
        &self.slot_index
    }

    pub fn num_layers(&self) -> usize {
        self.caches.len()
    }

    pub fn capacity(&self) -> usize {
        self.caches.first().map(KvCache::capacity).unwrap_or(0)
    }

    pub fn cache(&self, layer: usize) -> Result<&KvCache> {
        let bound = self.caches.len();
        self.caches.get(layer).ok_or(KvError::IndexOutOfBounds {
            what: "layer",
            index: layer,
            bound,
        })
    }

    pub fn cache_mut(&mut self, layer: usize) -> Result<&mut KvCache> {
        let bound = self.caches.len();
        self.caches.get_mut(layer).ok_or(KvError::IndexOutOfBounds {
            what: "layer",
            index: layer,
            bound,
        })
    }

    /// Write this step's keys/values for `layer` at the installed slots.
    pub fn write(&mut self, layer: usize, combined_kv: &Tensor) -> Result<()> {
        let Self { caches, slot_index, .. } = self;
        let bound = caches.len();
        let cache = caches.get_mut(layer).ok_or(KvError::IndexOutOfBounds {
            what: "layer",
            index: layer,
            bound,
        })?;
        cache.write(combined_kv, slot_index)
    }

    /// Free a finished request's rows in every layer.
    pub fn release(&mut self, slots: &[usize]) -> Result<()> {
        for cache in &mut self.caches {
            cache.release(slots)?;
        }
        Ok(())
    }
}
