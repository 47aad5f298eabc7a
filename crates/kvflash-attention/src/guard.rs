//! Sanitize-and-verify pass over layer outputs.

use kvflash_core::{KvError, Result, Tensor};
use tracing::{error, warn};

/// Replaces NaN/Inf in a layer output, then rechecks once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericGuard {
    sentinel: f32,
}

impl Default for NumericGuard {
    fn default() -> Self {
        Self { sentinel: 1e-8 }
    }
}

impl NumericGuard {
    pub fn new(sentinel: f32) -> Self {
        Self { sentinel }
    }

    pub fn sentinel(&self) -> f32 {
        self.sentinel
    }

    /// Returns how many values were replaced.
    ///
    /// Fails with [`KvError::NumericDivergence`] naming `layer` if any
    /// non-finite value is still present after replacement.
    pub fn sanitize_and_verify(&self, output: &mut Tensor, layer: usize) -> Result<usize> {
        if output.all_finite() {
            return Ok(0);
        }

        let mut replaced = 0;
        for x in output.as_mut_slice().iter_mut() {
            if !x.is_finite() {
                *x = self.sentinel;
                replaced += 1;
            }
        }
        warn!(layer, replaced, sentinel = self.sentinel, "replaced non-finite attention outputs");

        let remaining = output.as_slice().iter().filter(|x| !x.is_finite()).count();
        if remaining > 0 {
            error!(layer, remaining, "non-finite values survived sanitization");
            return Err(KvError::NumericDivergence { layer, count: remaining });
        }
        Ok(replaced)
    }
}
