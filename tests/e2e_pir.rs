//! End-to-end PIR scenario: the server returns the requested payload
//! without learning its index.

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
fn pir_retrieve_returns_selected_payload() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    coord.setup_collection("pir", 4, "IP", true).expect("setup");

    let vectors: Vec<Vec<f32>> = (0..5)
        .map(|i| vec![0.1 * i as f32, 0.2, 0.0, -0.1])
        .collect();
    let payloads: Vec<String> = (0..5).map(|i| format!("p{i}")).collect();
    coord.insert("pir", &vectors, &payloads).expect("insert");

    let payload = coord.retrieve_pir("pir", 3).expect("pir retrieve");
    assert_eq!(payload, b"p3");

    coord.drop_collection("pir").expect("drop");
}

#[test]
fn direct_retrieve_matches_inserted_payloads() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut coord = coordinator();

    coord
        .setup_collection("direct", 4, "COSINE", true)
        .expect("setup");

    let vectors: Vec<Vec<f32>> = (0..3).map(|i| vec![1.0, i as f32, 0.0, 0.0]).collect();
    let payloads = vec![
        "first".to_string(),
        "second".to_string(),
        "third".to_string(),
    ];
    coord.insert("direct", &vectors, &payloads).expect("insert");

    for (i, want) in payloads.iter().enumerate() {
        let got = coord.retrieve("direct", i as u64).expect("retrieve");
        assert_eq!(got, want.as_bytes());
    }

    let err = coord.retrieve("direct", 3).expect_err("out of range");
    assert!(matches!(
        err,
        evd::EvdError::IndexOutOfRange { index: 3, db_size: 3 }
    ));

    let err = coord.retrieve_pir("direct", 9).expect_err("out of range");
    assert!(matches!(
        err,
        evd::EvdError::IndexOutOfRange { index: 9, db_size: 3 }
    ));

    coord.drop_collection("direct").expect("drop");
}
