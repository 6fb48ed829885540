//! Vector encodings: full precision, INT8 scalar, binary sign bits and PQ codes.
//!
//! [`VectorEncoder`] turns a raw vector into a [`VectorPayload`] for the configured
//! [`QuantizationKind`] and back. Search code never inspects payloads directly; it
//! works on [`ScoringVector`]s (the traversal-ready form of a payload) scored
//! against a [`PreparedQuery`].

/// Binary quantization: sign-bit packing and Hamming distance.
pub mod binary;
/// Product quantization: codebook training, encoding and ADC lookup tables.
pub mod pq;
/// INT8 scalar quantization with per-vector min/scale calibration.
pub mod scalar;

pub use binary::BinaryVector;
pub use pq::{PqCodebook, PqDistanceTable, PqParams};
pub use scalar::QuantizedVector;

use crate::error::{IndexError, Result};
use crate::hnsw::distance::DistanceFunction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Storage representation chosen for an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QuantizationKind {
    #[default]
    None,
    Int8,
    Binary,
    Product,
}

impl QuantizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationKind::None => "NONE",
            QuantizationKind::Int8 => "INT8",
            QuantizationKind::Binary => "BINARY",
            QuantizationKind::Product => "PRODUCT",
        }
    }

    /// Whether graph traversal scores a lossy form that must be reranked.
    pub fn needs_rerank(&self) -> bool {
        matches!(self, QuantizationKind::Int8 | QuantizationKind::Binary)
    }
}

impl fmt::Display for QuantizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizationKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(QuantizationKind::None),
            "INT8" => Ok(QuantizationKind::Int8),
            "BINARY" => Ok(QuantizationKind::Binary),
            "PRODUCT" | "PQ" => Ok(QuantizationKind::Product),
            other => Err(IndexError::InvalidQuantizationConfig(format!(
                "unknown quantization kind '{}'",
                other
            ))),
        }
    }
}

/// Encoded form of a vector.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorPayload {
    Full(Arc<[f32]>),
    Int8(QuantizedVector),
    Binary(BinaryVector),
    Product { codebook_version: u64, codes: Vec<u8> },
}

impl VectorPayload {
    pub fn kind(&self) -> QuantizationKind {
        match self {
            VectorPayload::Full(_) => QuantizationKind::None,
            VectorPayload::Int8(_) => QuantizationKind::Int8,
            VectorPayload::Binary(_) => QuantizationKind::Binary,
            VectorPayload::Product { .. } => QuantizationKind::Product,
        }
    }

    /// Traversal-ready form of this payload. PQ codes are scored through
    /// lookup tables instead and have no scoring vector.
    pub fn scoring_vector(&self) -> Option<ScoringVector> {
        match self {
            VectorPayload::Full(v) => Some(ScoringVector::Dense(Arc::clone(v))),
            VectorPayload::Int8(q) => Some(ScoringVector::Dense(q.dequantize().into())),
            VectorPayload::Binary(b) => Some(ScoringVector::Bits(b.bits.clone().into())),
            VectorPayload::Product { .. } => None,
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            // Full payloads share the store's vector allocation
            VectorPayload::Full(_) => 16,
            VectorPayload::Int8(q) => q.data.len() + 12,
            VectorPayload::Binary(b) => b.bits.len() + 8,
            VectorPayload::Product { codes, .. } => codes.len() + 8,
        }
    }
}

/// Converts raw vectors to and from their stored representation.
#[derive(Debug, Clone, Copy)]
pub struct VectorEncoder {
    dimension: usize,
    kind: QuantizationKind,
}

impl VectorEncoder {
    pub fn new(dimension: usize, kind: QuantizationKind) -> Self {
        Self { dimension, kind }
    }

    pub fn kind(&self) -> QuantizationKind {
        self.kind
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Fail with `DimensionMismatch` unless `len` is the configured dimension.
    pub fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: len,
            });
        }
        Ok(())
    }

    /// Encode `raw` for the configured kind. `Product` requires a trained codebook.
    pub fn encode(&self, raw: &[f32], codebook: Option<&PqCodebook>) -> Result<VectorPayload> {
        self.check_dimension(raw.len())?;
        Ok(match self.kind {
            QuantizationKind::None => VectorPayload::Full(raw.into()),
            QuantizationKind::Int8 => VectorPayload::Int8(QuantizedVector::quantize(raw)),
            QuantizationKind::Binary => VectorPayload::Binary(BinaryVector::quantize(raw)),
            QuantizationKind::Product => {
                let cb = codebook.ok_or(IndexError::CodebookNotTrained)?;
                VectorPayload::Product {
                    codebook_version: cb.version,
                    codes: cb.encode(raw)?,
                }
            }
        })
    }

    /// Representation kept by the vector store.
    ///
    /// PQ codes depend on the codebook generation and are owned by the PQ engine,
    /// so `Product` indexes store the full vector here, sharing its allocation.
    pub fn encode_stored(&self, raw: &Arc<[f32]>) -> Result<VectorPayload> {
        match self.kind {
            QuantizationKind::None | QuantizationKind::Product => {
                self.check_dimension(raw.len())?;
                Ok(VectorPayload::Full(Arc::clone(raw)))
            }
            _ => self.encode(raw, None),
        }
    }

    /// Decode a payload back to f32 (lossy for every kind except `None`).
    pub fn decode(&self, payload: &VectorPayload, codebook: Option<&PqCodebook>) -> Result<Vec<f32>> {
        match payload {
            VectorPayload::Full(v) => Ok(v.to_vec()),
            VectorPayload::Int8(q) => Ok(q.dequantize()),
            VectorPayload::Binary(b) => Ok(b.dequantize()),
            VectorPayload::Product {
                codebook_version,
                codes,
            } => {
                let cb = codebook.ok_or(IndexError::CodebookNotTrained)?;
                if cb.version != *codebook_version {
                    return Err(IndexError::StaleCodebook {
                        codebook_version: cb.version,
                        encoded_version: *codebook_version,
                    });
                }
                Ok(cb.reconstruct(codes))
            }
        }
    }
}

/// A stored vector in the form graph traversal scores against.
#[derive(Debug, Clone)]
pub enum ScoringVector {
    Dense(Arc<[f32]>),
    Bits(Arc<[u8]>),
}

impl ScoringVector {
    pub fn memory_bytes(&self) -> usize {
        match self {
            ScoringVector::Dense(v) => v.len() * 4,
            ScoringVector::Bits(b) => b.len(),
        }
    }
}

/// A query prepared once per search: the dense vector plus, for binary
/// indexes, its packed sign bits.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub dense: Vec<f32>,
    pub bits: Option<Vec<u8>>,
    distance: DistanceFunction,
}

impl PreparedQuery {
    pub fn new(query: &[f32], distance: DistanceFunction, kind: QuantizationKind) -> Self {
        let bits = (kind == QuantizationKind::Binary).then(|| binary::pack_signs(query));
        Self {
            dense: query.to_vec(),
            bits,
            distance,
        }
    }

    /// Distance from the query to a stored scoring vector.
    #[inline]
    pub fn score(&self, target: &ScoringVector) -> f32 {
        match (target, &self.bits) {
            (ScoringVector::Dense(v), _) => self.distance.distance(&self.dense, v),
            (ScoringVector::Bits(b), Some(q)) => {
                self.distance.distance_bits(q, b, self.dense.len())
            }
            (ScoringVector::Bits(b), None) => {
                let q = binary::pack_signs(&self.dense);
                self.distance.distance_bits(&q, b, self.dense.len())
            }
        }
    }

    /// Exact distance to a full-precision vector.
    #[inline]
    pub fn exact(&self, target: &[f32]) -> f32 {
        self.distance.distance(&self.dense, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantization_kind() {
        assert_eq!("int8".parse::<QuantizationKind>().unwrap(), QuantizationKind::Int8);
        assert_eq!("PRODUCT".parse::<QuantizationKind>().unwrap(), QuantizationKind::Product);
        assert_eq!(" Binary ".parse::<QuantizationKind>().unwrap(), QuantizationKind::Binary);
        assert!(matches!(
            "FP16".parse::<QuantizationKind>(),
            Err(IndexError::InvalidQuantizationConfig(_))
        ));
    }

    #[test]
    fn test_none_roundtrip_is_exact() {
        let enc = VectorEncoder::new(4, QuantizationKind::None);
        let v = vec![0.25, -1.5, 3.0, 1e-7];
        let payload = enc.encode(&v, None).unwrap();
        assert_eq!(enc.decode(&payload, None).unwrap(), v);
    }

    #[test]
    fn test_encode_rejects_wrong_dimension() {
        let enc = VectorEncoder::new(4, QuantizationKind::Int8);
        let err = enc.encode(&[1.0, 2.0], None).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_product_requires_codebook() {
        let enc = VectorEncoder::new(4, QuantizationKind::Product);
        assert!(matches!(
            enc.encode(&[1.0, 2.0, 3.0, 4.0], None),
            Err(IndexError::CodebookNotTrained)
        ));
    }

    #[test]
    fn test_product_decode_detects_stale_codebook() {
        let data: Vec<Vec<f32>> = (0..64)
            .map(|i| (0..4).map(|j| ((i * 7 + j * 3) % 11) as f32).collect())
            .collect();
        let params = PqParams {
            subspaces: 2,
            clusters: 8,
            center_globally: false,
            training_limit: 64,
        };
        let cb1 = PqCodebook::train(&data, 4, &params, 1, 3).unwrap();
        let cb2 = PqCodebook::train(&data, 4, &params, 2, 3).unwrap();
        let enc = VectorEncoder::new(4, QuantizationKind::Product);
        let payload = enc.encode(&data[0], Some(&cb1)).unwrap();
        assert!(enc.decode(&payload, Some(&cb1)).is_ok());
        assert!(matches!(
            enc.decode(&payload, Some(&cb2)),
            Err(IndexError::StaleCodebook {
                codebook_version: 2,
                encoded_version: 1
            })
        ));
    }

    #[test]
    fn test_stored_payload_shares_allocation() {
        let enc = VectorEncoder::new(3, QuantizationKind::None);
        let raw: Arc<[f32]> = vec![1.0, 2.0, 3.0].into();
        match enc.encode_stored(&raw).unwrap() {
            VectorPayload::Full(v) => assert!(Arc::ptr_eq(&v, &raw)),
            other => panic!("expected full payload, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_scoring_uses_bits() {
        let enc = VectorEncoder::new(4, QuantizationKind::Binary);
        let payload = enc.encode(&[1.0, -1.0, 1.0, -1.0], None).unwrap();
        let sv = payload.scoring_vector().unwrap();
        let q = PreparedQuery::new(
            &[1.0, -1.0, 1.0, -1.0],
            DistanceFunction::Euclidean,
            QuantizationKind::Binary,
        );
        assert_eq!(q.score(&sv), 0.0);
    }
}
