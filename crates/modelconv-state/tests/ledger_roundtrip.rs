//! Ledger contract tests: round-trip and cross-process visibility.

use modelconv_state::ResultsStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    spec: String,
    state: String,
    image: Option<String>,
}

fn records() -> Vec<Record> {
    vec![
        Record {
            spec: "trt-fp16-opset13".to_string(),
            state: "failed".to_string(),
            image: None,
        },
        Record {
            spec: "trt-tf32-opset13".to_string(),
            state: "succeeded".to_string(),
            image: None,
        },
    ]
}

/// Test: load(dump(name, R)) == R
#[test]
fn test_dump_then_load_returns_same_list() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultsStore::new(dir.path());

    let written = records();
    store.dump("convert_model", &written).unwrap();
    let read: Vec<Record> = store.load("convert_model").unwrap();

    assert_eq!(read, written);
}

/// Test: a second store over the same workspace sees the first one's writes,
/// and can patch and re-dump them (the host-after-container flow).
#[test]
fn test_separate_store_instances_share_workspace() {
    let dir = tempfile::tempdir().unwrap();

    let sandbox_side = ResultsStore::new(dir.path());
    sandbox_side.dump("convert_model", &records()).unwrap();

    let host_side = ResultsStore::new(dir.path());
    let mut loaded: Vec<Record> = host_side.load("convert_model").unwrap();
    for r in &mut loaded {
        r.image = Some("nvcr.io/nvidia/pytorch:21.12-py3".to_string());
    }
    host_side.dump("convert_model", &loaded).unwrap();

    let reread: Vec<Record> = sandbox_side.load("convert_model").unwrap();
    assert_eq!(reread.len(), 2);
    assert!(reread.iter().all(|r| r.image.is_some()));
    assert_eq!(reread[1].spec, "trt-tf32-opset13");
}
