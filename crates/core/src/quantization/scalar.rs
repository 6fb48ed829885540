//! INT8 scalar quantization.
//!
//! Each f32 vector is compressed to u8 by finding its min and max values,
//! then linearly mapping each component to \[0, 255\]. The `min` and `scale`
//! parameters are stored per vector for dequantization, so the reconstruction
//! error of every component is at most `(max - min) / 510`.

use serde::{Deserialize, Serialize};

/// Scalar-quantized vector: f32 → u8 with min/max for reconstruction.
/// `scale` is precomputed as (max - min) / 255.0 to avoid redundant division in hot paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedVector {
    pub data: Vec<u8>,
    pub min: f32,
    pub max: f32,
    pub scale: f32,
}

impl QuantizedVector {
    /// Quantize a f32 vector to u8 using min-max scaling.
    pub fn quantize(vector: &[f32]) -> Self {
        if vector.is_empty() {
            return Self {
                data: Vec::new(),
                min: 0.0,
                max: 0.0,
                scale: 0.0,
            };
        }

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in vector {
            min = min.min(v);
            max = max.max(v);
        }

        let range = max - min;
        let (data, scale) = if range < f32::EPSILON {
            (vec![0u8; vector.len()], 0.0)
        } else {
            let inv_scale = 255.0 / range;
            let data = vector
                .iter()
                .map(|&v| ((v - min) * inv_scale).round().clamp(0.0, 255.0) as u8)
                .collect();
            (data, range / 255.0)
        };

        Self {
            data,
            min,
            max,
            scale,
        }
    }

    /// Dequantize back to f32. Lossy.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.data.len()];
        self.dequantize_into(&mut out);
        out
    }

    /// Dequantize into the provided buffer (no allocation).
    #[inline]
    pub fn dequantize_into(&self, buf: &mut [f32]) {
        for (dst, &b) in buf.iter_mut().zip(&self.data) {
            *dst = self.min + b as f32 * self.scale;
        }
    }

    /// Returns the dimensionality of the quantized vector.
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    /// Largest per-component reconstruction error this encoding can produce.
    pub fn max_error(&self) -> f32 {
        (self.max - self.min) / 510.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quantize_dequantize_roundtrip() {
        let v = vec![0.1, -0.5, 0.9, 0.0, 0.3];
        let q = QuantizedVector::quantize(&v);
        assert_eq!(q.dim(), 5);
        let d = q.dequantize();
        for (a, b) in v.iter().zip(d.iter()) {
            assert!((a - b).abs() <= q.max_error() + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_constant_vector() {
        let v = vec![0.7; 6];
        let q = QuantizedVector::quantize(&v);
        assert_eq!(q.scale, 0.0);
        assert_eq!(q.dequantize(), v);
    }

    #[test]
    fn test_empty_vector() {
        let q = QuantizedVector::quantize(&[]);
        assert_eq!(q.dim(), 0);
        assert!(q.dequantize().is_empty());
    }

    #[test]
    fn test_extremes_map_to_code_bounds() {
        let q = QuantizedVector::quantize(&[-2.0, 0.0, 2.0]);
        assert_eq!(q.data[0], 0);
        assert_eq!(q.data[2], 255);
    }

    proptest! {
        #[test]
        fn test_int8_error_is_bounded(v in proptest::collection::vec(-100.0f32..100.0, 1..64)) {
            let q = QuantizedVector::quantize(&v);
            let d = q.dequantize();
            let magnitude = q.max.abs().max(q.min.abs()).max(1.0);
            let bound = q.max_error() + magnitude * 1e-5;
            for (a, b) in v.iter().zip(&d) {
                prop_assert!((a - b).abs() <= bound, "{} vs {} (bound {})", a, b, bound);
            }
        }
    }
}
