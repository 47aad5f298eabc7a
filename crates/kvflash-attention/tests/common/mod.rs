//! Shared helpers for the attention integration tests.
//!
//! Stands in for the collaborators the core does not own: position tables
//! and per-step slot assignment.

#![allow(dead_code)]

use kvflash_attention::{DecodeBatch, PositionTables, PrefillBatch, RowTable, StepKind};
use kvflash_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

/// HF-style rotary tables, [1, positions.len(), head_dim].
pub fn rope_tables(positions: &[usize], head_dim: usize) -> PositionTables {
    let (cos, sin) = rope_rows(positions, head_dim);
    let dims = [1, positions.len(), head_dim];
    PositionTables::new(Tensor::from_vec(cos, &dims).unwrap(), Tensor::from_vec(sin, &dims).unwrap()).unwrap()
}

/// One position per decode request, [positions.len(), 1, head_dim].
pub fn decode_tables(positions: &[usize], head_dim: usize) -> PositionTables {
    let (cos, sin) = rope_rows(positions, head_dim);
    let dims = [positions.len(), 1, head_dim];
    PositionTables::new(Tensor::from_vec(cos, &dims).unwrap(), Tensor::from_vec(sin, &dims).unwrap()).unwrap()
}

fn rope_rows(positions: &[usize], head_dim: usize) -> (Vec<f32>, Vec<f32>) {
    let half = head_dim / 2;
    let mut cos = Vec::with_capacity(positions.len() * head_dim);
    let mut sin = Vec::with_capacity(positions.len() * head_dim);
    for &pos in positions {
        for j in 0..head_dim {
            let freq = 1.0 / 10000f32.powf(2.0 * (j % half) as f32 / head_dim as f32);
            let angle = pos as f32 * freq;
            cos.push(angle.cos());
            sin.push(angle.sin());
        }
    }
    (cos, sin)
}

/// A step as the slot-assignment collaborator would hand it over.
pub struct PlannedStep {
    pub step: StepKind,
    pub slots: Vec<usize>,
    pub positions: Vec<usize>,
}

/// Hands out cache rows from a shuffled free list, so request histories
/// are scattered through the arena.
pub struct SlotBook {
    free: Vec<usize>,
    requests: Vec<Vec<usize>>,
}

impl SlotBook {
    pub fn new(capacity: usize, seed: u64) -> Self {
        let mut free: Vec<usize> = (0..capacity).collect();
        free.shuffle(&mut StdRng::seed_from_u64(seed));
        Self { free, requests: Vec::new() }
    }

    /// Contiguous rows `0..capacity` in order.
    pub fn sequential(capacity: usize) -> Self {
        Self {
            free: (0..capacity).rev().collect(),
            requests: Vec::new(),
        }
    }

    pub fn requests(&self) -> &[Vec<usize>] {
        &self.requests
    }

    pub fn tokens_held(&self) -> usize {
        self.requests.iter().map(Vec::len).sum()
    }

    fn take(&mut self) -> usize {
        self.free.pop().expect("slot arena exhausted")
    }

    /// Admit new requests with the given prompt lengths.
    pub fn prefill(&mut self, lens: &[usize]) -> PlannedStep {
        let mut slots = Vec::new();
        let mut positions = Vec::new();
        for &len in lens {
            let rows: Vec<usize> = (0..len).map(|_| self.take()).collect();
            slots.extend_from_slice(&rows);
            positions.extend(0..len);
            self.requests.push(rows);
        }
        PlannedStep {
            step: StepKind::Prefill(PrefillBatch::packed(lens.to_vec())),
            slots,
            positions,
        }
    }

    /// One new token for every live request.
    pub fn decode(&mut self) -> PlannedStep {
        let mut slots = Vec::new();
        for b in 0..self.requests.len() {
            let slot = self.take();
            self.requests[b].push(slot);
            slots.push(slot);
        }
        let lens: Vec<usize> = self.requests.iter().map(Vec::len).collect();
        let positions = lens.iter().map(|l| l - 1).collect();
        let table = RowTable::from_requests(&self.requests);
        PlannedStep {
            step: StepKind::Decode(DecodeBatch::new(table, lens).unwrap()),
            slots,
            positions,
        }
    }
}
