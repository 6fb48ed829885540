//! End-to-end properties of the index: recall, counts, rebuild scheduling and
//! concurrent reads during maintenance.

use lsmvec_core::{
    DistanceFunction, IndexMetadata, PqParams, QuantizationKind, RecordId, Storage, VectorIndex,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

fn brute_force(vectors: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u64> {
    let mut scored: Vec<(f32, u64)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (DistanceFunction::Euclidean.distance(query, v), i as u64))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}

fn recall(found: &[RecordId], truth: &[u64]) -> f64 {
    let truth: HashSet<u64> = truth.iter().copied().collect();
    let hits = found.iter().filter(|id| truth.contains(&id.0)).count();
    hits as f64 / truth.len() as f64
}

fn euclidean(dim: usize) -> IndexMetadata {
    IndexMetadata::new(dim).with_distance(DistanceFunction::Euclidean)
}

fn fill(index: &VectorIndex, vectors: &[Vec<f32>]) {
    for (c, chunk) in vectors.chunks(100).enumerate() {
        let mut tx = index.begin();
        for (j, v) in chunk.iter().enumerate() {
            tx.put((c * 100 + j) as u64, v).unwrap();
        }
        tx.commit().unwrap();
    }
}

#[test]
fn test_exact_search_recall_is_perfect_on_small_data() {
    let vectors = random_vectors(1_000, 8, 42);
    let index = VectorIndex::create(
        euclidean(8)
            .with_beam_width(200)
            .with_mutations_before_rebuild(0),
        Storage::InMemory,
    )
    .unwrap();
    fill(&index, &vectors);
    index.build_now().unwrap();

    for query in random_vectors(50, 8, 7) {
        let hits = index.search(&query, 10).unwrap();
        let ids: Vec<RecordId> = hits.iter().map(|h| h.id).collect();
        assert_eq!(recall(&ids, &brute_force(&vectors, &query, 10)), 1.0);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }
}

#[test]
fn test_overquery_improves_approximate_recall() {
    let vectors = random_vectors(2_000, 32, 3);
    let pq = PqParams {
        subspaces: 4,
        clusters: 16,
        ..PqParams::default()
    };
    let index = VectorIndex::create(
        euclidean(32)
            .with_quantization(QuantizationKind::Product)
            .with_pq(pq)
            .with_beam_width(128)
            .with_mutations_before_rebuild(0),
        Storage::InMemory,
    )
    .unwrap();
    fill(&index, &vectors);
    index.build_now().unwrap();
    assert!(index.stats().codebook_version.is_some());

    let queries = random_vectors(50, 32, 11);
    let mean_recall = |factor: usize| -> f64 {
        let total: f64 = queries
            .iter()
            .map(|q| {
                let hits = index.search_approximate(q, 10, factor).unwrap();
                let ids: Vec<RecordId> = hits.iter().map(|h| h.id).collect();
                recall(&ids, &brute_force(&vectors, q, 10))
            })
            .sum();
        total / queries.len() as f64
    };
    let r1 = mean_recall(1);
    let r4 = mean_recall(4);
    let r8 = mean_recall(8);
    assert!(r1 <= r4, "r1={r1} r4={r4}");
    assert!(r4 <= r8, "r4={r4} r8={r8}");
    assert!(r8 > r1, "r1={r1} r8={r8}");
}

#[test]
fn test_rebuild_leaves_no_tombstones() {
    let vectors = random_vectors(400, 8, 5);
    let index =
        VectorIndex::create(euclidean(8).with_mutations_before_rebuild(0), Storage::InMemory)
            .unwrap();
    fill(&index, &vectors);
    let mut tx = index.begin();
    for id in (0..400u64).step_by(2) {
        tx.delete(id);
    }
    tx.commit().unwrap();
    assert_eq!(index.stats().tombstones, 200);

    let report = index.build_now().unwrap();
    assert_eq!(report.nodes, 200);
    let stats = index.stats();
    assert_eq!(stats.tombstones, 0);
    assert_eq!(stats.graph_nodes, 200);

    for query in random_vectors(20, 8, 9) {
        for hit in index.search(&query, 10).unwrap() {
            assert_eq!(hit.id.0 % 2, 1, "deleted record {} returned", hit.id);
        }
    }
}

#[test]
fn test_mutation_threshold_triggers_rebuild() {
    let vectors = random_vectors(10_000, 16, 21);
    let index = VectorIndex::create(
        euclidean(16)
            .with_max_connections(16)
            .with_beam_width(32)
            .with_mutations_before_rebuild(1_000),
        Storage::InMemory,
    )
    .unwrap();

    for (i, v) in vectors.iter().take(1_000).enumerate() {
        assert!(!index.should_rebuild());
        index.put(i as u64, v).unwrap();
    }
    assert!(index.should_rebuild());
    assert_eq!(index.generation(), 0);

    index.put(1_000u64, &vectors[1_000]).unwrap();
    assert_eq!(index.generation(), 1);
    assert!(!index.should_rebuild());

    for (i, v) in vectors.iter().enumerate().skip(1_001) {
        index.put(i as u64, v).unwrap();
    }
    assert_eq!(index.count(), 10_000);
    assert!(index.generation() >= 9);
    let hits = index.search(&vectors[1234], 1).unwrap();
    assert_eq!(hits[0].id, RecordId(1234));
}

#[test]
fn test_concurrent_searches_during_build() {
    let vectors = random_vectors(2_000, 16, 8);
    let index =
        VectorIndex::create(euclidean(16).with_mutations_before_rebuild(0), Storage::InMemory)
            .unwrap();
    fill(&index, &vectors);

    std::thread::scope(|s| {
        let readers: Vec<_> = (0..8)
            .map(|t| {
                let index = &index;
                let vectors = &vectors;
                s.spawn(move || {
                    for round in 0..25 {
                        let id = (t * 97 + round * 13) % vectors.len();
                        let hits = index.search(&vectors[id], 5).unwrap();
                        assert_eq!(hits.len(), 5);
                        assert_eq!(hits[0].id, RecordId(id as u64));
                        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
                    }
                })
            })
            .collect();
        let report = index.build_now().unwrap();
        assert_eq!(report.nodes, 2_000);
        for r in readers {
            r.join().unwrap();
        }
    });
    assert_eq!(index.generation(), 1);
}

#[test]
fn test_graph_holds_no_vector_copies_when_disabled() {
    let vectors = random_vectors(300, 8, 1);
    let without = VectorIndex::create(
        euclidean(8)
            .with_vectors_in_graph(false)
            .with_mutations_before_rebuild(0),
        Storage::InMemory,
    )
    .unwrap();
    fill(&without, &vectors);
    without.build_now().unwrap();
    assert_eq!(without.stats().vector_copies, 0);

    let with = VectorIndex::create(
        euclidean(8)
            .with_vectors_in_graph(true)
            .with_mutations_before_rebuild(0),
        Storage::InMemory,
    )
    .unwrap();
    fill(&with, &vectors);
    with.delete(0u64).unwrap();
    assert_eq!(with.stats().vector_copies, 299);

    // Identical results either way
    let query = &vectors[10];
    let a: Vec<RecordId> = without.search(query, 5).unwrap().iter().map(|h| h.id).collect();
    assert_eq!(a[0], RecordId(10));
    let b = with.search(query, 5).unwrap();
    assert_eq!(b[0].id, RecordId(10));
}

#[test]
fn test_int8_and_binary_results_are_exact_distances() {
    let vectors = random_vectors(200, 16, 77);
    for kind in [QuantizationKind::Int8, QuantizationKind::Binary] {
        let index = VectorIndex::create(
            euclidean(16)
                .with_quantization(kind)
                .with_mutations_before_rebuild(0),
            Storage::InMemory,
        )
        .unwrap();
        fill(&index, &vectors);
        let query = &vectors[99];
        let hits = index.search_with_overquery(query, 5, 40).unwrap();
        assert_eq!(hits[0].id, RecordId(99), "{kind}");
        for hit in &hits {
            let stored = &vectors[hit.id.0 as usize];
            let exact = DistanceFunction::Euclidean.distance(query, stored);
            assert!((hit.distance - exact).abs() < 1e-5);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_count_is_inserts_minus_deletes(n in 1usize..120, delete_ratio in 0.0f64..1.0) {
        let vectors = random_vectors(n, 4, n as u64);
        let index = VectorIndex::create(
            euclidean(4).with_mutations_before_rebuild(25),
            Storage::InMemory,
        )
        .unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.put(i as u64, v).unwrap();
        }
        let m = (n as f64 * delete_ratio) as usize;
        for id in 0..m as u64 {
            index.delete(id).unwrap();
        }
        // Deleting again changes nothing
        for id in 0..m as u64 {
            index.delete(id).unwrap();
        }
        prop_assert_eq!(index.count(), n - m);
        prop_assert_eq!(index.stats().live_count, n - m);
    }
}
