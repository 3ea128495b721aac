use driftsync_storage::QueueStore;
use driftsync_types::{QueueStats, SyncTask, TaskStatus, TaskType};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn make_task(entity: &str, id: &str, now: i64) -> SyncTask {
    SyncTask::new(
        TaskType::upsert(entity),
        json!({"id": id}),
        Some(format!("{entity}:{id}")),
        now,
    )
}

#[test]
fn insert_get_delete() {
    let store = QueueStore::open_in_memory().unwrap();
    let task = make_task("invoice", "A", 100);
    store.insert(&task).unwrap();

    assert_eq!(store.get(&task.id).unwrap(), Some(task.clone()));
    store.delete(&task.id).unwrap();
    assert_eq!(store.get(&task.id).unwrap(), None);
}

#[test]
fn find_by_dedupe_key() {
    let store = QueueStore::open_in_memory().unwrap();
    let task = make_task("invoice", "A", 100);
    store.insert(&task).unwrap();

    let found = store.find_by_dedupe_key("invoice:A").unwrap().unwrap();
    assert_eq!(found.id, task.id);
    assert!(store.find_by_dedupe_key("invoice:B").unwrap().is_none());
}

#[test]
fn delete_by_dedupe_key_removes_only_that_task() {
    let store = QueueStore::open_in_memory().unwrap();
    let a = make_task("invoice", "A", 100);
    let b = make_task("invoice", "B", 100);
    store.insert(&a).unwrap();
    store.insert(&b).unwrap();

    assert!(store.delete_by_dedupe_key("invoice:A").unwrap());
    assert!(!store.delete_by_dedupe_key("invoice:A").unwrap());
    assert_eq!(store.get(&a.id).unwrap(), None);
    assert_eq!(store.get(&b.id).unwrap(), Some(b));
}

#[test]
fn dedupe_key_is_unique() {
    let store = QueueStore::open_in_memory().unwrap();
    store.insert(&make_task("invoice", "A", 100)).unwrap();
    assert!(store.insert(&make_task("invoice", "A", 101)).is_err());
}

#[test]
fn update_rewrites_task() {
    let store = QueueStore::open_in_memory().unwrap();
    let mut task = make_task("invoice", "A", 100);
    store.insert(&task).unwrap();

    task.attempts = 3;
    task.status = TaskStatus::Failed;
    task.last_error = Some("boom".into());
    task.payload = json!({"id": "A", "amount": 20});
    assert!(store.update(&task).unwrap());
    assert_eq!(store.get(&task.id).unwrap(), Some(task.clone()));

    store.delete(&task.id).unwrap();
    assert!(!store.update(&task).unwrap());
}

#[test]
fn due_orders_by_retry_then_creation() {
    let store = QueueStore::open_in_memory().unwrap();
    let mut late = make_task("t", "late", 10);
    late.next_retry_at = 500;
    let early = make_task("t", "early", 20);
    let first = make_task("t", "first", 5);
    let mut future = make_task("t", "future", 1);
    future.next_retry_at = 10_000;

    for task in [&late, &early, &first, &future] {
        store.insert(task).unwrap();
    }

    let due = store.due(1_000, 10).unwrap();
    let order: Vec<_> = due.iter().map(|t| t.payload["id"].as_str().unwrap()).collect();
    assert_eq!(order, vec!["first", "early", "late"]);

    assert_eq!(store.due(1_000, 2).unwrap().len(), 2);
}

#[test]
fn due_skips_processing_and_parked() {
    let store = QueueStore::open_in_memory().unwrap();
    let mut busy = make_task("t", "busy", 0);
    busy.status = TaskStatus::Processing;
    let mut parked = make_task("t", "parked", 0);
    parked.status = TaskStatus::Failed;
    parked.next_retry_at = SyncTask::PARKED;
    store.insert(&busy).unwrap();
    store.insert(&parked).unwrap();

    assert!(store.due(i64::MAX - 1, 10).unwrap().is_empty());
}

#[test]
fn next_retry_at_considers_only_pending() {
    let store = QueueStore::open_in_memory().unwrap();
    assert_eq!(store.next_retry_at().unwrap(), None);

    let mut later = make_task("t", "later", 0);
    later.next_retry_at = 9_000;
    let mut sooner = make_task("t", "sooner", 0);
    sooner.next_retry_at = 4_000;
    let mut busy = make_task("t", "busy", 0);
    busy.status = TaskStatus::Processing;
    let mut parked = make_task("t", "parked", 0);
    parked.park();
    for task in [&later, &sooner, &busy, &parked] {
        store.insert(task).unwrap();
    }

    assert_eq!(store.next_retry_at().unwrap(), Some(4_000));
    store.delete(&sooner.id).unwrap();
    assert_eq!(store.next_retry_at().unwrap(), Some(9_000));
}

#[test]
fn stats_count_by_status() {
    let store = QueueStore::open_in_memory().unwrap();
    store.insert(&make_task("t", "a", 0)).unwrap();
    store.insert(&make_task("t", "b", 0)).unwrap();
    let mut failed = make_task("t", "c", 0);
    failed.status = TaskStatus::Failed;
    store.insert(&failed).unwrap();
    let mut busy = make_task("t", "d", 0);
    busy.status = TaskStatus::Processing;
    store.insert(&busy).unwrap();

    assert_eq!(
        store.stats().unwrap(),
        QueueStats {
            pending: 2,
            processing: 1,
            failed: 1
        }
    );
}

#[test]
fn reset_processing_and_revive_failed() {
    let store = QueueStore::open_in_memory().unwrap();
    let mut busy = make_task("t", "busy", 0);
    busy.status = TaskStatus::Processing;
    busy.next_retry_at = 50;
    let mut parked = make_task("t", "parked", 0);
    parked.status = TaskStatus::Failed;
    parked.next_retry_at = SyncTask::PARKED;
    store.insert(&busy).unwrap();
    store.insert(&parked).unwrap();

    assert_eq!(store.reset_processing(900).unwrap(), 1);
    let reset = store.get(&busy.id).unwrap().unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.next_retry_at, 900);

    assert_eq!(store.revive_failed(950).unwrap(), 1);
    let revived = store.get(&parked.id).unwrap().unwrap();
    assert_eq!(revived.status, TaskStatus::Pending);
    assert_eq!(revived.next_retry_at, 950);
}

#[test]
fn meta_roundtrip() {
    let store = QueueStore::open_in_memory().unwrap();
    assert_eq!(store.meta_get("k").unwrap(), None);
    store.meta_set("k", "1").unwrap();
    store.meta_set("k", "2").unwrap();
    assert_eq!(store.meta_get("k").unwrap(), Some("2".to_string()));
    store.meta_delete("k").unwrap();
    assert_eq!(store.meta_get("k").unwrap(), None);
}

#[test]
fn tasks_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let task = make_task("invoice", "A", 100);
    {
        let store = QueueStore::open(&path).unwrap();
        store.insert(&task).unwrap();
    }
    let store = QueueStore::open(&path).unwrap();
    assert_eq!(store.all().unwrap(), vec![task]);
}
