use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Working precisions a tensor can be tagged with.
///
/// Storage is always `f32`; a reduced precision means every stored value is
/// representable in that format (values are rounded on entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit IEEE 754 single-precision float
    #[default]
    F32,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
}

impl DType {
    /// Size in bytes of a single element in this precision.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    /// Whether values are rounded below f32 precision.
    pub fn is_reduced(&self) -> bool {
        !matches!(self, DType::F32)
    }

    /// Round a value to this precision (identity for F32).
    #[inline]
    pub fn round(&self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Round every element of `values` in place.
    pub fn round_slice(&self, values: &mut [f32]) {
        if self.is_reduced() {
            for v in values.iter_mut() {
                *v = self.round(*v);
            }
        }
    }

    /// Parse the names used by HuggingFace configs (`torch_dtype`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Some(DType::F32),
            "f16" | "float16" | "half" => Some(DType::F16),
            "bf16" | "bfloat16" => Some(DType::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::F16.element_size(), 2);
        assert_eq!(DType::BF16.element_size(), 2);
    }

    #[test]
    fn test_round() {
        assert_eq!(DType::F32.round(0.1), 0.1);
        let h = DType::F16.round(0.1);
        assert!((h - 0.1).abs() < 1e-4);
        assert_ne!(h, 0.1);
        // 1 + 2^-10 is exact in f16 but not in bf16 (7 mantissa bits)
        let x = 1.0 + 1.0 / 1024.0;
        assert_eq!(DType::F16.round(x), x);
        assert_eq!(DType::BF16.round(x), 1.0);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(DType::from_name("float16"), Some(DType::F16));
        assert_eq!(DType::from_name("BFloat16"), Some(DType::BF16));
        assert_eq!(DType::from_name("float32"), Some(DType::F32));
        assert_eq!(DType::from_name("int8"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::BF16), "bf16");
    }
}
