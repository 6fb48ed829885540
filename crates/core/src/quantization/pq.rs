//! Product Quantization (PQ) for fast approximate distance computation.
//!
//! Splits vectors into M contiguous subspaces and learns up to 256 centroids per
//! subspace via k-means. Each vector is encoded as M bytes (one centroid ID per
//! subspace). Distance computation uses a per-query lookup table: M table lookups
//! and M additions instead of D multiply-adds.
//!
//! When `center_globally` is set, the mean of the training sample is subtracted
//! before clustering, so centroids describe residuals around a shared center.
//! Dimensions that do not divide evenly are spread over the first subspaces.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::distance::DistanceFunction;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// PQ training parameters, as configured on the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqParams {
    /// Number of subspaces. 0 derives one subspace per 4 dimensions.
    pub subspaces: usize,
    /// Centroids per subspace (1..=256).
    pub clusters: usize,
    /// Subtract the global mean before clustering.
    pub center_globally: bool,
    /// Maximum number of vectors sampled for training.
    pub training_limit: usize,
}

impl Default for PqParams {
    fn default() -> Self {
        Self {
            subspaces: config::PQ_DEFAULT_SUBSPACES,
            clusters: config::PQ_DEFAULT_CLUSTERS,
            center_globally: false,
            training_limit: config::PQ_DEFAULT_TRAINING_LIMIT,
        }
    }
}

impl PqParams {
    /// Number of subspaces actually used for `dimension`.
    pub fn resolved_subspaces(&self, dimension: usize) -> usize {
        if self.subspaces == 0 {
            (dimension / 4).max(1)
        } else {
            self.subspaces
        }
    }

    /// Reject parameter combinations that cannot produce a codebook.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        let m = self.resolved_subspaces(dimension);
        if m > dimension {
            return Err(IndexError::InvalidQuantizationConfig(format!(
                "pq_subspaces {} exceeds dimension {}",
                m, dimension
            )));
        }
        if self.clusters == 0 || self.clusters > config::PQ_MAX_CLUSTERS {
            return Err(IndexError::InvalidQuantizationConfig(format!(
                "pq_clusters must be in 1..={}, got {}",
                config::PQ_MAX_CLUSTERS,
                self.clusters
            )));
        }
        if self.training_limit < self.clusters {
            return Err(IndexError::InvalidQuantizationConfig(format!(
                "pq_training_limit {} is smaller than pq_clusters {}",
                self.training_limit, self.clusters
            )));
        }
        Ok(())
    }
}

/// Trained PQ codebook. Immutable once trained; retraining produces a new
/// codebook with a higher `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqCodebook {
    pub version: u64,
    pub dimension: usize,
    pub num_subspaces: usize,
    pub num_centroids: usize,
    /// Subspace `s` covers dimensions `offsets[s]..offsets[s + 1]`.
    pub offsets: Vec<usize>,
    /// Global center subtracted before encoding (`center_globally`).
    pub center: Option<Vec<f32>>,
    /// Per subspace: `num_centroids * sub_len` floats.
    pub centroids: Vec<Vec<f32>>,
    /// Per subspace and centroid: `2 * center_s·c + |c|²`, the centroid's
    /// contribution to the squared norm of a reconstructed vector.
    norm_terms: Vec<Vec<f32>>,
    center_norm_sq: f32,
    /// Number of vectors the codebook was trained on.
    pub training_size: usize,
}

/// Precomputed distance table for a single query.
pub struct PqDistanceTable {
    distance: DistanceFunction,
    num_centroids: usize,
    /// `[M][K]` partial scores.
    table: Vec<f32>,
    /// `[M][K]` norm contributions (cosine only).
    norms: Vec<f32>,
    constant: f32,
    center_norm_sq: f32,
    query_norm: f32,
}

fn subspace_offsets(dimension: usize, m: usize) -> Vec<usize> {
    let base = dimension / m;
    let rem = dimension % m;
    let mut offsets = Vec::with_capacity(m + 1);
    let mut at = 0;
    offsets.push(0);
    for s in 0..m {
        at += base + usize::from(s < rem);
        offsets.push(at);
    }
    offsets
}

impl PqCodebook {
    /// Train a codebook on `vectors`.
    ///
    /// Fails with [`IndexError::InsufficientTrainingData`] when fewer vectors than
    /// `params.clusters` are available. At most `params.training_limit` vectors,
    /// chosen with a seeded RNG, are used.
    pub fn train<V: AsRef<[f32]>>(
        vectors: &[V],
        dimension: usize,
        params: &PqParams,
        version: u64,
        seed: u64,
    ) -> Result<Self> {
        params.validate(dimension)?;
        let n = vectors.len();
        if n < params.clusters {
            return Err(IndexError::InsufficientTrainingData {
                available: n,
                required: params.clusters,
            });
        }

        let mut rng = StdRng::seed_from_u64(seed ^ version.rotate_left(17));
        let sample: Vec<&[f32]> = if n > params.training_limit {
            rand::seq::index::sample(&mut rng, n, params.training_limit)
                .into_iter()
                .map(|i| vectors[i].as_ref())
                .collect()
        } else {
            vectors.iter().map(|v| v.as_ref()).collect()
        };
        for v in &sample {
            if v.len() != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: v.len(),
                });
            }
        }

        let center = if params.center_globally {
            let mut mean = vec![0.0f64; dimension];
            for v in &sample {
                for (acc, &x) in mean.iter_mut().zip(v.iter()) {
                    *acc += x as f64;
                }
            }
            let inv = 1.0 / sample.len() as f64;
            Some(mean.into_iter().map(|x| (x * inv) as f32).collect::<Vec<f32>>())
        } else {
            None
        };

        let m = params.resolved_subspaces(dimension);
        let offsets = subspace_offsets(dimension, m);
        let k = params.clusters;
        let mut centroids = Vec::with_capacity(m);

        for sub in 0..m {
            let (lo, hi) = (offsets[sub], offsets[sub + 1]);
            let sub_len = hi - lo;
            let mut sub_vectors = Vec::with_capacity(sample.len() * sub_len);
            for v in &sample {
                match &center {
                    Some(c) => sub_vectors.extend(v[lo..hi].iter().zip(&c[lo..hi]).map(|(x, c)| x - c)),
                    None => sub_vectors.extend_from_slice(&v[lo..hi]),
                }
            }
            centroids.push(kmeans(&sub_vectors, sub_len, k, &mut rng));
        }

        let mut codebook = Self {
            version,
            dimension,
            num_subspaces: m,
            num_centroids: k,
            offsets,
            center,
            centroids,
            norm_terms: Vec::new(),
            center_norm_sq: 0.0,
            training_size: sample.len(),
        };
        codebook.compute_norm_terms();
        Ok(codebook)
    }

    fn compute_norm_terms(&mut self) {
        let mut terms = Vec::with_capacity(self.num_subspaces);
        for sub in 0..self.num_subspaces {
            let (lo, hi) = (self.offsets[sub], self.offsets[sub + 1]);
            let sub_len = hi - lo;
            let mut row = Vec::with_capacity(self.num_centroids);
            for ci in 0..self.num_centroids {
                let c = &self.centroids[sub][ci * sub_len..(ci + 1) * sub_len];
                let mut t: f32 = c.iter().map(|x| x * x).sum();
                if let Some(center) = &self.center {
                    t += 2.0 * c.iter().zip(&center[lo..hi]).map(|(a, b)| a * b).sum::<f32>();
                }
                row.push(t);
            }
            terms.push(row);
        }
        self.norm_terms = terms;
        self.center_norm_sq = self
            .center
            .as_ref()
            .map_or(0.0, |c| c.iter().map(|x| x * x).sum());
    }

    #[inline]
    fn sub_len(&self, sub: usize) -> usize {
        self.offsets[sub + 1] - self.offsets[sub]
    }

    /// Encode a single vector into M PQ codes.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut codes = Vec::with_capacity(self.num_subspaces);
        let mut residual = Vec::new();
        for sub in 0..self.num_subspaces {
            let (lo, hi) = (self.offsets[sub], self.offsets[sub + 1]);
            residual.clear();
            match &self.center {
                Some(c) => residual.extend(vector[lo..hi].iter().zip(&c[lo..hi]).map(|(x, c)| x - c)),
                None => residual.extend_from_slice(&vector[lo..hi]),
            }
            codes.push(self.find_nearest_centroid(sub, &residual));
        }
        Ok(codes)
    }

    /// Reconstruct the approximate vector described by `codes`.
    pub fn reconstruct(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = match &self.center {
            Some(c) => c.clone(),
            None => vec![0.0f32; self.dimension],
        };
        for (sub, &code) in codes.iter().enumerate().take(self.num_subspaces) {
            let (lo, hi) = (self.offsets[sub], self.offsets[sub + 1]);
            let sub_len = hi - lo;
            let start = code as usize * sub_len;
            let c = &self.centroids[sub][start..start + sub_len];
            for (dst, &x) in out[lo..hi].iter_mut().zip(c) {
                *dst += x;
            }
        }
        out
    }

    /// Build the asymmetric distance lookup table for `query`.
    pub fn distance_table(&self, query: &[f32], distance: DistanceFunction) -> PqDistanceTable {
        let k = self.num_centroids;
        let mut table = vec![0.0f32; self.num_subspaces * k];
        let mut constant = 0.0f32;

        // Euclidean compares the centered query with residual centroids.
        // Inner product and cosine need q·center once, then q·c per subspace.
        if let Some(c) = &self.center {
            if distance != DistanceFunction::Euclidean {
                constant = query.iter().zip(c).map(|(a, b)| a * b).sum();
            }
        }

        for sub in 0..self.num_subspaces {
            let (lo, hi) = (self.offsets[sub], self.offsets[sub + 1]);
            let sub_len = self.sub_len(sub);
            let q_sub = &query[lo..hi];
            for ci in 0..k {
                let centroid = &self.centroids[sub][ci * sub_len..(ci + 1) * sub_len];
                table[sub * k + ci] = match distance {
                    DistanceFunction::Euclidean => {
                        let mut sum = 0.0f32;
                        for d in 0..sub_len {
                            let q = match &self.center {
                                Some(c) => q_sub[d] - c[lo + d],
                                None => q_sub[d],
                            };
                            let diff = q - centroid[d];
                            sum += diff * diff;
                        }
                        sum
                    }
                    DistanceFunction::InnerProduct | DistanceFunction::Cosine => {
                        q_sub.iter().zip(centroid).map(|(a, b)| a * b).sum()
                    }
                };
            }
        }

        let norms = if distance == DistanceFunction::Cosine {
            self.norm_terms.iter().flatten().copied().collect()
        } else {
            Vec::new()
        };

        PqDistanceTable {
            distance,
            num_centroids: k,
            table,
            norms,
            constant,
            center_norm_sq: self.center_norm_sq,
            query_norm: query.iter().map(|x| x * x).sum::<f32>().sqrt(),
        }
    }

    /// Find nearest centroid in a subspace. Ties resolve to the lower index.
    #[inline]
    fn find_nearest_centroid(&self, sub: usize, sub_vec: &[f32]) -> u8 {
        let sub_len = sub_vec.len();
        let mut best_idx = 0u8;
        let mut best_dist = f32::MAX;
        for ci in 0..self.num_centroids {
            let centroid = &self.centroids[sub][ci * sub_len..(ci + 1) * sub_len];
            let dist = sq_dist(sub_vec, centroid);
            if dist < best_dist {
                best_dist = dist;
                best_idx = ci as u8;
            }
        }
        best_idx
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        let floats: usize = self.centroids.iter().map(Vec::len).sum::<usize>()
            + self.norm_terms.iter().map(Vec::len).sum::<usize>()
            + self.center.as_ref().map_or(0, Vec::len);
        floats * 4 + self.offsets.len() * 8
    }
}

impl PqDistanceTable {
    /// Approximate distance for a PQ-encoded vector, on the same scale as
    /// [`DistanceFunction::distance`].
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        let k = self.num_centroids;
        let mut acc = 0.0f32;
        for (m, &code) in codes.iter().enumerate() {
            acc += self.table[m * k + code as usize];
        }
        match self.distance {
            DistanceFunction::Euclidean => acc,
            DistanceFunction::InnerProduct => -(acc + self.constant),
            DistanceFunction::Cosine => {
                let mut norm_sq = self.center_norm_sq;
                for (m, &code) in codes.iter().enumerate() {
                    norm_sq += self.norms[m * k + code as usize];
                }
                let denom = self.query_norm * norm_sq.max(0.0).sqrt();
                if denom < 1e-10 {
                    1.0
                } else {
                    1.0 - (acc + self.constant) / denom
                }
            }
        }
    }
}

/// K-means clustering with k-means++ initialization.
/// Returns k × sub_len centroids as flat Vec<f32>.
fn kmeans(data: &[f32], sub_len: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len() / sub_len.max(1);
    let mut centroids = vec![0.0f32; k * sub_len];
    if n == 0 || sub_len == 0 {
        return centroids;
    }
    if n <= k {
        // Fewer points than centroids: each point is its own centroid, repeated cyclically
        for ci in 0..k {
            let p = ci % n;
            centroids[ci * sub_len..(ci + 1) * sub_len]
                .copy_from_slice(&data[p * sub_len..(p + 1) * sub_len]);
        }
        return centroids;
    }

    let first = rng.gen_range(0..n);
    centroids[..sub_len].copy_from_slice(&data[first * sub_len..(first + 1) * sub_len]);

    // Distance from each point to its nearest chosen centroid
    let mut min_dists = vec![f32::MAX; n];

    for ci in 1..k {
        let last = &centroids[(ci - 1) * sub_len..ci * sub_len];
        let mut total = 0.0f64;
        for i in 0..n {
            let point = &data[i * sub_len..(i + 1) * sub_len];
            let d = sq_dist(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        let chosen = if total < 1e-30 {
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids[ci * sub_len..(ci + 1) * sub_len]
            .copy_from_slice(&data[chosen * sub_len..(chosen + 1) * sub_len]);
    }

    let mut assignments = vec![0usize; n];
    let mut sums = vec![0.0f32; k * sub_len];
    let mut counts = vec![0u32; k];

    for iteration in 0..config::PQ_KMEANS_ITERATIONS {
        let mut changed = iteration == 0;
        for i in 0..n {
            let point = &data[i * sub_len..(i + 1) * sub_len];
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for ci in 0..k {
                let d = sq_dist(point, &centroids[ci * sub_len..(ci + 1) * sub_len]);
                if d < best_dist {
                    best_dist = d;
                    best = ci;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }

        sums.fill(0.0);
        counts.fill(0);
        for (i, &ci) in assignments.iter().enumerate() {
            counts[ci] += 1;
            let point = &data[i * sub_len..(i + 1) * sub_len];
            for (acc, &x) in sums[ci * sub_len..(ci + 1) * sub_len].iter_mut().zip(point) {
                *acc += x;
            }
        }
        // Empty clusters keep their previous centroid
        for ci in 0..k {
            if counts[ci] > 0 {
                let inv = 1.0 / counts[ci] as f32;
                for d in 0..sub_len {
                    centroids[ci * sub_len + d] = sums[ci * sub_len + d] * inv;
                }
            }
        }

        if !changed {
            break;
        }
    }

    centroids
}

/// Squared Euclidean distance between two sub-vectors.
#[inline]
fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        sum += d * d;
    }
    sum
}
