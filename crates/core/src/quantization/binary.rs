//! Binary (sign-bit) quantization.
//!
//! Each dimension is reduced to one bit: 1 when the component is `>= 0`,
//! 0 otherwise. Bits are packed little-endian within each byte (dimension `i`
//! lives in byte `i / 8`, bit `i % 8`). Distances between packed vectors are
//! Hamming distances; the encoding is too lossy to rank final results and
//! is always followed by a full-precision rerank.

use serde::{Deserialize, Serialize};

/// A sign-bit packed vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryVector {
    pub bits: Vec<u8>,
    pub dimension: usize,
}

impl BinaryVector {
    /// Pack the signs of `vector` into `ceil(len / 8)` bytes.
    pub fn quantize(vector: &[f32]) -> Self {
        Self {
            bits: pack_signs(vector),
            dimension: vector.len(),
        }
    }

    /// Expand back to a ±1.0 vector.
    pub fn dequantize(&self) -> Vec<f32> {
        (0..self.dimension)
            .map(|i| {
                if self.bits[i / 8] & (1 << (i % 8)) != 0 {
                    1.0
                } else {
                    -1.0
                }
            })
            .collect()
    }
}

/// Number of bytes needed to pack `dimension` sign bits.
#[inline]
pub fn packed_len(dimension: usize) -> usize {
    dimension.div_ceil(8)
}

/// Pack the signs of a vector. Shared by stored vectors and prepared queries.
pub fn pack_signs(vector: &[f32]) -> Vec<u8> {
    let mut bits = vec![0u8; packed_len(vector.len())];
    for (i, &v) in vector.iter().enumerate() {
        if v >= 0.0 {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    bits
}
