//! End-to-end similarity scenarios over the in-process transport:
//! setup → insert → query → top-k → retrieve.
//!
//! Each test drives a fresh service through the full wire codec. The
//! collections are heavyweight (full key blobs at N = 4096), so the
//! tests serialize on a module lock to bound peak memory.

use std::sync::{Arc, Mutex};

use evd::coordinator::CoordinatorConfig;
use evd::{Coordinator, EvdService, InProcessTransport};

static LOCK: Mutex<()> = Mutex::new(());

fn coordinator() -> Coordinator<InProcessTransport> {
    let service = Arc::new(EvdService::new());
    Coordinator::new(
        InProcessTransport::new(service),
        CoordinatorConfig::default(),
    )
    .expect("coordinator construction")
}

#[test]
fn tiny_inner_product_roundtrip() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    let db_size = coord
        .setup_collection("tiny-ip", 4, "IP", true)
        .expect("setup");
    assert_eq!(db_size, 0);

    coord
        .insert(
            "tiny-ip",
            &[vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]],
            &["a".to_string(), "b".to_string()],
        )
        .expect("insert");

    let scores = coord.query("tiny-ip", &[1.0, 0.0, 0.0, 0.0]).expect("query");
    assert_eq!(scores.len(), 2);
    let eps = (2.0f32).powi(-10);
    assert!((scores[0] - 1.0).abs() < eps, "score[0] = {}", scores[0]);
    assert!(scores[1].abs() < eps, "score[1] = {}", scores[1]);

    let top = coord
        .query_top_k("tiny-ip", &[1.0, 0.0, 0.0, 0.0], 1)
        .expect("top-k");
    assert_eq!(top, vec![0]);

    let payload = coord.retrieve("tiny-ip", 0).expect("retrieve");
    assert_eq!(payload, b"a");

    coord.drop_collection("tiny-ip").expect("drop");
    coord.terminate();
}

#[test]
fn cosine_with_plaintext_query() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    coord
        .setup_collection("cosine-ptxt", 8, "COSINE", false)
        .expect("setup");

    // Ten unit vectors; number 7 matches the query exactly.
    let query = normalize(&[0.3, -0.1, 0.5, 0.2, -0.4, 0.1, 0.6, -0.2]);
    let mut vectors = Vec::new();
    let mut payloads = Vec::new();
    for i in 0..10u32 {
        let v = if i == 7 {
            query.clone()
        } else {
            normalize(&[
                (i as f32).sin(),
                (i as f32 * 0.7).cos(),
                0.2 + i as f32 * 0.05,
                -0.3,
                (i as f32 * 1.3).sin(),
                0.4,
                -0.1 * i as f32,
                0.25,
            ])
        };
        vectors.push(v);
        payloads.push(format!("payload-{i}"));
    }
    coord
        .insert("cosine-ptxt", &vectors, &payloads)
        .expect("insert");

    let results = coord
        .query_top_k_with_scores("cosine-ptxt", &query, 1)
        .expect("query");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, 7);
    assert!(
        (results[0].1 - 1.0).abs() < 1e-2,
        "top score = {}",
        results[0].1
    );

    coord.drop_collection("cosine-ptxt").expect("drop");
}

#[test]
fn query_crosses_block_boundary() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    const DIM: usize = 128;
    const COUNT: usize = 4096 + 3;

    coord
        .setup_collection("blocks", DIM as u64, "IP", true)
        .expect("setup");

    // Deterministic pseudo-random vectors with modest entries.
    let vector = |seed: u64| -> Vec<f32> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..DIM)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32 - 0.5) * 0.2
            })
            .collect()
    };

    let vectors: Vec<Vec<f32>> = (0..COUNT as u64).map(vector).collect();
    let payloads: Vec<String> = (0..COUNT).map(|i| format!("p{i}")).collect();
    coord.insert("blocks", &vectors, &payloads).expect("insert");

    let query = vectors[4097].clone();
    let scores = coord.query("blocks", &query).expect("query");
    assert_eq!(scores.len(), COUNT);

    let expected: f32 = query.iter().zip(&vectors[4097]).map(|(a, b)| a * b).sum();
    assert!(
        (scores[4097] - expected).abs() < 1e-2,
        "score {} vs expected {}",
        scores[4097],
        expected
    );

    // The matching vector dominates its own inner product.
    let top = coord.query_top_k("blocks", &query, 1).expect("top-k");
    assert_eq!(top, vec![4097]);

    coord.drop_collection("blocks").expect("drop");
}

#[test]
fn dimension_mismatch_keeps_server_record() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let service = Arc::new(EvdService::new());
    let mut coord = Coordinator::new(
        InProcessTransport::new(Arc::clone(&service)),
        CoordinatorConfig::default(),
    )
    .expect("coordinator");

    coord
        .setup_collection("strict", 8, "COSINE", true)
        .expect("setup");

    let err = coord
        .setup_collection("strict", 16, "COSINE", true)
        .expect_err("mismatched setup must fail");
    assert!(matches!(
        err,
        evd::EvdError::DimensionMismatch {
            expected: 8,
            got: 16
        }
    ));

    // A second coordinator probing with the original dimension still
    // sees the intact record.
    let mut probe = Coordinator::new(
        InProcessTransport::new(service),
        CoordinatorConfig::default(),
    )
    .expect("coordinator");
    let db_size = probe
        .setup_collection("strict", 8, "COSINE", true)
        .expect("re-setup");
    assert_eq!(db_size, 0);
}

#[test]
fn drop_then_recreate_resets_collection() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    coord
        .setup_collection("fresh", 4, "IP", true)
        .expect("setup");
    let vectors: Vec<Vec<f32>> = (0..10).map(|i| vec![i as f32 * 0.1, 0.0, 0.0, 0.0]).collect();
    let payloads: Vec<String> = (0..10).map(|i| format!("v{i}")).collect();
    coord.insert("fresh", &vectors, &payloads).expect("insert");
    assert_eq!(coord.db_size("fresh"), Some(10));

    coord.drop_collection("fresh").expect("drop");

    let db_size = coord
        .setup_collection("fresh", 4, "IP", true)
        .expect("re-setup");
    assert_eq!(db_size, 0);

    let err = coord.retrieve("fresh", 0).expect_err("empty collection");
    assert!(matches!(
        err,
        evd::EvdError::IndexOutOfRange { index: 0, db_size: 0 }
    ));
}

#[test]
fn collections_are_isolated() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    coord.setup_collection("iso-a", 4, "IP", true).expect("setup a");
    coord.setup_collection("iso-b", 4, "IP", true).expect("setup b");

    coord
        .insert(
            "iso-b",
            &[vec![0.0, 0.5, 0.0, 0.0]],
            &["b0".to_string()],
        )
        .expect("insert b");

    let before = coord.query("iso-b", &[0.0, 1.0, 0.0, 0.0]).expect("query b");

    // Mutating collection A must not disturb B's scores or payloads.
    coord
        .insert(
            "iso-a",
            &[vec![1.0, 0.0, 0.0, 0.0], vec![0.5, 0.5, 0.0, 0.0]],
            &["a0".to_string(), "a1".to_string()],
        )
        .expect("insert a");

    let after = coord.query("iso-b", &[0.0, 1.0, 0.0, 0.0]).expect("query b");
    assert_eq!(before.len(), after.len());
    for (x, y) in before.iter().zip(&after) {
        assert!((x - y).abs() < 1e-3, "{x} vs {y}");
    }
    assert_eq!(coord.retrieve("iso-b", 0).expect("retrieve"), b"b0");
    assert_eq!(coord.db_size("iso-b"), Some(1));

    coord.drop_collection("iso-a").expect("drop a");
    coord.drop_collection("iso-b").expect("drop b");
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}
