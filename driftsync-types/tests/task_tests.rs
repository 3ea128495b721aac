use driftsync_types::{QueueStats, SyncTask, TaskKind, TaskStatus, TaskType};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

// ── TaskType ─────────────────────────────────────────────────────

#[test]
fn task_type_display() {
    assert_eq!(TaskType::upsert("invoice").to_string(), "upsert:invoice");
    assert_eq!(TaskType::update("invoice").to_string(), "update:invoice");
    assert_eq!(TaskType::delete("invoice").to_string(), "delete:invoice");
}

#[test]
fn task_type_parse() {
    let parsed: TaskType = "delete:payment".parse().unwrap();
    assert_eq!(parsed.kind, TaskKind::Delete);
    assert_eq!(parsed.entity, "payment");
}

#[test]
fn task_type_entity_may_contain_colon() {
    let parsed: TaskType = "upsert:ledger:2024".parse().unwrap();
    assert_eq!(parsed.entity, "ledger:2024");
}

#[test]
fn task_type_rejects_unknown_kind() {
    assert!("patch:invoice".parse::<TaskType>().is_err());
    assert!("upsert".parse::<TaskType>().is_err());
    assert!("upsert:".parse::<TaskType>().is_err());
}

#[test]
fn task_type_serializes_as_string() {
    let json = serde_json::to_value(TaskType::upsert("customer")).unwrap();
    assert_eq!(json, json!("upsert:customer"));
    let back: TaskType = serde_json::from_value(json).unwrap();
    assert_eq!(back, TaskType::upsert("customer"));
}

proptest! {
    #[test]
    fn task_type_string_form_is_stable(entity in "[a-z_]{1,16}") {
        for kind in [TaskKind::Upsert, TaskKind::Update, TaskKind::Delete] {
            let ty = TaskType::new(kind, entity.clone());
            let parsed: TaskType = ty.to_string().parse().unwrap();
            prop_assert_eq!(parsed, ty);
        }
    }
}

// ── SyncTask ─────────────────────────────────────────────────────

#[test]
fn new_task_is_pending_and_due() {
    let task = SyncTask::new(
        TaskType::upsert("invoice"),
        json!({"id": "A"}),
        Some("invoice:A".into()),
        1_000,
    );
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.next_retry_at, 1_000);
    assert!(task.is_due(1_000));
    assert!(!task.is_due(999));
}

#[test]
fn processing_task_is_never_due() {
    let mut task = SyncTask::new(TaskType::upsert("x"), json!({}), None, 0);
    task.status = TaskStatus::Processing;
    assert!(!task.is_due(i64::MAX - 1));
}

#[test]
fn parked_task_is_never_due() {
    let mut task = SyncTask::new(TaskType::upsert("x"), json!({}), None, 0);
    task.attempts = 10;
    task.park();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.is_parked());
    assert!(!task.is_due(i64::MAX - 1));

    task.next_retry_at = 50;
    assert!(!task.is_parked());
    assert!(task.is_due(50));
}

#[test]
fn status_parse() {
    assert_eq!("processing".parse::<TaskStatus>().unwrap(), TaskStatus::Processing);
    assert!("done".parse::<TaskStatus>().is_err());
}

#[test]
fn queue_stats_total() {
    let stats = QueueStats {
        pending: 2,
        processing: 1,
        failed: 4,
    };
    assert_eq!(stats.total(), 7);
    assert_eq!(QueueStats::default().total(), 0);
}
