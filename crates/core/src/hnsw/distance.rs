//! Distance functions for graph traversal and reranking.
//!
//! Supports three distance functions: cosine, euclidean (L2) and inner product.
//! All of them return a distance where **lower is better** (more similar), so the
//! graph code can order candidates without knowing which function is configured.

use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance function configured for an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceFunction {
    /// Cosine distance: `1 - cosine_similarity`. Range: \[0, 2\].
    Cosine,
    /// Squared Euclidean distance (L2²). Range: \[0, ∞).
    Euclidean,
    /// Negative inner product: `-dot(a, b)`. Lower = higher similarity.
    InnerProduct,
}

impl DistanceFunction {
    /// Exact f32-vs-f32 distance. Used for construction, exact search and reranking.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceFunction::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceFunction::Euclidean => euclidean_sq(a, b),
            DistanceFunction::InnerProduct => -dot_product(a, b),
        }
    }

    /// Approximate distance between two sign-bit packed vectors of `dimension` bits.
    ///
    /// Hamming distance is mapped onto the same scale as [`distance`](Self::distance)
    /// for ±1 vectors so that binary traversal and full-precision rerank agree on order.
    #[inline]
    pub fn distance_bits(&self, a: &[u8], b: &[u8], dimension: usize) -> f32 {
        let h = hamming(a, b) as f32;
        let d = dimension as f32;
        match self {
            DistanceFunction::Cosine => 2.0 * h / d.max(1.0),
            DistanceFunction::Euclidean => 4.0 * h,
            DistanceFunction::InnerProduct => 2.0 * h - d,
        }
    }

    /// Canonical lowercase name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceFunction::Cosine => "cosine",
            DistanceFunction::Euclidean => "euclidean",
            DistanceFunction::InnerProduct => "inner_product",
        }
    }
}

impl fmt::Display for DistanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceFunction {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceFunction::Cosine),
            "euclidean" | "l2" => Ok(DistanceFunction::Euclidean),
            "inner_product" | "dot_product" | "dot" => Ok(DistanceFunction::InnerProduct),
            other => Err(IndexError::InvalidDistanceFunction(other.to_string())),
        }
    }
}

/// Cosine similarity between two f32 slices. Zero vectors have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    dot / denom
}

/// Squared Euclidean distance between two f32 slices.
pub fn euclidean_sq(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

/// Dot product between two f32 slices.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

/// Sum of squares.
#[inline]
pub fn norm_sq(v: &[f32]) -> f32 {
    dot_product(v, v)
}

/// Number of differing bits between two packed bit vectors.
/// Processes 8-byte words with `count_ones`, then the remainder byte by byte.
pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut a_words = a.chunks_exact(8);
    let mut b_words = b.chunks_exact(8);
    for (wa, wb) in a_words.by_ref().zip(b_words.by_ref()) {
        let mut xa = [0u8; 8];
        let mut xb = [0u8; 8];
        xa.copy_from_slice(wa);
        xb.copy_from_slice(wb);
        count += (u64::from_le_bytes(xa) ^ u64::from_le_bytes(xb)).count_ones();
    }
    for (x, y) in a_words.remainder().iter().zip(b_words.remainder()) {
        count += (x ^ y).count_ones();
    }
    count
}
