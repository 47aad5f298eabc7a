//! Causal masking for packed sequences.

/// Logit written into masked positions.
///
/// Large and negative but finite: `exp` of it underflows to exactly zero,
/// while a fully masked tile still has a finite maximum (no `inf - inf`).
pub const MASKED_LOGIT: f32 = -1.0e8;

/// Whether query position `row` may attend to key position `col`.
#[inline]
pub fn causal_visible(row: usize, col: usize) -> bool {
    row >= col
}

/// Mask a [rows, cols] score tile whose top-left element is at
/// (`row_start`, `col_start`) in sequence coordinates.
///
/// Returns the number of masked elements.
pub fn apply_causal(scores: &mut [f32], rows: usize, cols: usize, row_start: usize, col_start: usize) -> usize {
    // Tiles entirely at or below the diagonal need no work.
    if col_start + cols <= row_start + 1 {
        return 0;
    }
    let mut masked = 0;
    for r in 0..rows {
        for c in 0..cols {
            if !causal_visible(row_start + r, col_start + c) {
                scores[r * cols + c] = MASKED_LOGIT;
                masked += 1;
            }
        }
    }
    masked
}

/// Dense additive causal mask, [seq_len, seq_len] (0 = attend, -inf = masked).
///
/// Only the reference path materializes this; kernels mask per tile.
pub fn causal_mask(seq_len: usize) -> Vec<f32> {
    let mut data = vec![f32::NEG_INFINITY; seq_len * seq_len];
    for i in 0..seq_len {
        for j in 0..=i {
            data[i * seq_len + j] = 0.0;
        }
    }
    data
}
