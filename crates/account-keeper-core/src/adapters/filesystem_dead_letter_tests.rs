//! Tests for the filesystem dead-letter sink

use super::*;
use crate::ProviderKind;
use tempfile::TempDir;

fn record(event_id: &str) -> DeadLetterRecord {
    DeadLetterRecord::new(
        ProviderKind::Billing,
        Some(event_id.to_string()),
        Some("customer.subscription.created".to_string()),
        "unknown_user",
        "no account linked to cus_1",
        false,
        br#"{"id":"evt_1"}"#,
    )
}

#[tokio::test]
async fn test_sink_creates_base_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("nested");

    let sink = FilesystemDeadLetterSink::new(root.clone()).await.unwrap();

    assert!(root.exists());
    assert_eq!(sink.base_path(), root.as_path());
}

#[tokio::test]
async fn test_record_is_written_as_json_in_partitioned_path() {
    let temp_dir = TempDir::new().unwrap();
    let sink = FilesystemDeadLetterSink::new(temp_dir.path().to_path_buf())
        .await
        .unwrap();
    let record = record("evt_1");
    let path = sink.record_path(&record);

    sink.record(record.clone()).await.unwrap();

    assert!(path.exists());
    assert!(path
        .to_string_lossy()
        .contains(&format!("year={}", record.recorded_at.year())));
    assert!(!path.with_extension("tmp").exists());

    let written: DeadLetterRecord =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written, record);
}

#[tokio::test]
async fn test_records_for_distinct_events_do_not_collide() {
    let temp_dir = TempDir::new().unwrap();
    let sink = FilesystemDeadLetterSink::new(temp_dir.path().to_path_buf())
        .await
        .unwrap();

    let first = record("evt_1");
    let second = record("evt_2");
    sink.record(first.clone()).await.unwrap();
    sink.record(second.clone()).await.unwrap();

    assert_ne!(sink.record_path(&first), sink.record_path(&second));
    assert!(sink.record_path(&first).exists());
    assert!(sink.record_path(&second).exists());
}
