mod common;

use common::{harness, harness_with, init_tracing, quiet_config, START_MS};
use driftsync_storage::{QueueStore, SqliteStore};
use driftsync_sync::remote::memory::MemoryRemote;
use driftsync_sync::{
    processor_fn, EnqueueOptions, EntityBinding, QueueConfig, SyncEngine, SyncError, SyncQueue,
    TokioScheduler,
};
use driftsync_types::{ManualClock, QueueStats, SyncTask, TaskStatus, TaskType};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn register_counting(queue: &SyncQueue, entity: &str, result: Result<(), SyncError>) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue.register_sync_processor(
        TaskType::upsert(entity),
        processor_fn(move |_task: SyncTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            async move { result }
        }),
    );
    calls
}

fn only_task(queue: &SyncQueue) -> SyncTask {
    let mut tasks = queue.tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    tasks.remove(0)
}

// ── Dedupe ───────────────────────────────────────────────────────

#[tokio::test]
async fn same_dedupe_key_keeps_one_task_with_latest_payload() {
    let h = harness();
    let queue = h.engine.queue();

    let first = queue
        .enqueue(TaskType::upsert("note"), json!({"v": 1}), EnqueueOptions::deduped("note:1"))
        .unwrap();
    let second = queue
        .enqueue(TaskType::upsert("note"), json!({"v": 2}), EnqueueOptions::deduped("note:1"))
        .unwrap();

    assert_eq!(first.id, second.id);
    let task = only_task(queue);
    assert_eq!(task.payload, json!({"v": 2}));
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn tasks_without_dedupe_key_never_coalesce() {
    let h = harness();
    let queue = h.engine.queue();
    for v in 0..3 {
        queue
            .enqueue(TaskType::upsert("note"), json!({"v": v}), EnqueueOptions::default())
            .unwrap();
    }
    assert_eq!(queue.tasks().unwrap().len(), 3);
}

#[tokio::test]
async fn re_enqueue_of_failed_task_is_due_now_and_keeps_attempts() {
    let h = harness();
    let queue = h.engine.queue();
    register_counting(queue, "note", Err(SyncError::Transient("boom".into())));

    queue
        .enqueue(TaskType::upsert("note"), json!({"v": 1}), EnqueueOptions::deduped("note:1"))
        .unwrap();
    queue.process_sync_queue(10).await.unwrap();
    let retrying = only_task(queue);
    assert!(retrying.next_retry_at > START_MS);

    queue
        .enqueue(TaskType::upsert("note"), json!({"v": 2}), EnqueueOptions::deduped("note:1"))
        .unwrap();
    let task = only_task(queue);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.next_retry_at, START_MS);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.last_error, None);
}

// ── Processing & backoff ─────────────────────────────────────────

#[tokio::test]
async fn success_removes_task() {
    let h = harness();
    let queue = h.engine.queue();
    let calls = register_counting(queue, "note", Ok(()));

    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::deduped("note:1"))
        .unwrap();
    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(queue.tasks().unwrap().is_empty());
    assert_eq!(queue.stats(), QueueStats::default());
}

#[tokio::test]
async fn failures_back_off_linearly() {
    let h = harness();
    let queue = h.engine.queue();
    let calls = register_counting(queue, "note", Err(SyncError::Transient("boom".into())));
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();

    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 1);
    let task = only_task(queue);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_tried_at, Some(START_MS));
    assert_eq!(task.next_retry_at, START_MS + 2_000);
    assert!(task.last_error.unwrap().contains("boom"));

    // Not due yet.
    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.clock.advance(Duration::from_millis(2_000));
    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 1);
    let task = only_task(queue);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.next_retry_at, START_MS + 2_000 + 4_000);
}

#[tokio::test]
async fn exhausted_task_is_parked() {
    let mut config = quiet_config();
    config.queue = QueueConfig {
        max_attempts: 3,
        backoff_base_ms: 10,
        ..QueueConfig::default()
    };
    let h = harness_with(config);
    let queue = h.engine.queue();
    let calls = register_counting(queue, "note", Err(SyncError::Transient("boom".into())));
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();

    for attempt in 1..=3 {
        queue.process_sync_queue(10).await.unwrap();
        let task = only_task(queue);
        assert_eq!(task.attempts, attempt);
        assert_eq!(task.status == TaskStatus::Failed, attempt == 3);
        h.clock.advance(Duration::from_secs(1));
    }
    let task = only_task(queue);
    assert!(task.is_parked());
    assert_eq!(task.attempts, 3);

    h.clock.advance(Duration::from_secs(3_600));
    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().failed, 1);
}

#[tokio::test]
async fn permission_errors_park_immediately() {
    let h = harness();
    let queue = h.engine.queue();
    register_counting(queue, "note", Err(SyncError::Permission("denied".into())));
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();

    queue.process_sync_queue(10).await.unwrap();
    let task = only_task(queue);
    assert!(task.is_parked());
    assert_eq!(task.attempts, 1);
}

#[tokio::test]
async fn retry_failed_revives_parked_tasks() {
    let h = harness();
    let queue = h.engine.queue();
    register_counting(queue, "note", Err(SyncError::Permission("denied".into())));
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();
    queue.process_sync_queue(10).await.unwrap();

    assert_eq!(queue.retry_failed().unwrap(), 1);
    let task = only_task(queue);
    assert!(task.is_due(START_MS));
    assert_eq!(task.attempts, 1);
}

#[tokio::test]
async fn unknown_task_type_is_dropped() {
    let h = harness();
    let queue = h.engine.queue();
    let calls = register_counting(queue, "note", Ok(()));
    queue
        .enqueue(TaskType::upsert("ghost"), json!({}), EnqueueOptions::default())
        .unwrap();
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();

    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 2);
    assert!(queue.tasks().unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn due_tasks_run_oldest_first_up_to_limit() {
    let h = harness();
    let queue = h.engine.queue();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    queue.register_sync_processor(
        TaskType::upsert("note"),
        processor_fn(move |task: SyncTask| {
            seen.lock().unwrap().push(task.payload["n"].as_i64().unwrap());
            async { Ok::<(), SyncError>(()) }
        }),
    );
    for n in 0..5 {
        queue
            .enqueue(TaskType::upsert("note"), json!({"n": n}), EnqueueOptions::default())
            .unwrap();
        h.clock.advance(Duration::from_millis(1));
    }

    assert_eq!(queue.process_sync_queue(3).await.unwrap(), 3);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(queue.drain_sync_queue().await.unwrap(), 2);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

// ── Single flight ────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_runs_join_the_in_flight_run() {
    let h = harness();
    let queue = h.engine.queue().clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue.register_sync_processor(
        TaskType::upsert("note"),
        processor_fn(move |_task: SyncTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                Ok::<(), SyncError>(())
            }
        }),
    );
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();

    let (a, b) = futures::join!(queue.process_sync_queue(10), queue.process_sync_queue(10));
    assert_eq!(a, Ok(1));
    assert_eq!(b, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!queue.is_running());
}

#[tokio::test]
async fn enqueue_during_processing_keeps_newer_payload() {
    let h = harness();
    let queue = h.engine.queue().clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let requeue = queue.clone();
    queue.register_sync_processor(
        TaskType::upsert("note"),
        processor_fn(move |task: SyncTask| {
            log.lock().unwrap().push(task.payload["v"].clone());
            let requeue = requeue.clone();
            async move {
                if task.payload["v"] == json!(1) {
                    requeue.enqueue(
                        TaskType::upsert("note"),
                        json!({"v": 2}),
                        EnqueueOptions::deduped("note:1"),
                    )?;
                }
                Ok::<(), SyncError>(())
            }
        }),
    );
    queue
        .enqueue(TaskType::upsert("note"), json!({"v": 1}), EnqueueOptions::deduped("note:1"))
        .unwrap();

    queue.process_sync_queue(10).await.unwrap();
    let task = only_task(&queue);
    assert_eq!(task.payload, json!({"v": 2}));
    assert_eq!(task.status, TaskStatus::Pending);

    queue.drain_sync_queue().await.unwrap();
    assert!(queue.tasks().unwrap().is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
}

// ── Quota guard ──────────────────────────────────────────────────

#[tokio::test]
async fn tripped_guard_makes_runs_no_ops() {
    let h = harness();
    let queue = h.engine.queue();
    let calls = register_counting(queue, "note", Ok(()));
    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();

    h.engine.quota_guard().mark_disabled();
    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 0);
    assert_eq!(queue.drain_sync_queue().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    h.clock.advance(Duration::from_secs(60 * 60));
    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 1);
}

#[tokio::test]
async fn quota_failure_defers_rest_of_run() {
    let h = harness();
    let queue = h.engine.queue();
    let calls = register_counting(queue, "note", Err(SyncError::QuotaExceeded("slow down".into())));
    for n in 0..3 {
        queue
            .enqueue(TaskType::upsert("note"), json!({"n": n}), EnqueueOptions::default())
            .unwrap();
    }

    assert_eq!(queue.process_sync_queue(10).await.unwrap(), 1);
    assert!(h.engine.quota_guard().is_disabled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let untouched = queue
        .tasks()
        .unwrap()
        .into_iter()
        .filter(|task| task.attempts == 0)
        .count();
    assert_eq!(untouched, 2);
    assert_eq!(queue.stats().pending, 3);
}

// ── Stats & recovery ─────────────────────────────────────────────

#[tokio::test]
async fn stats_subscription_sees_current_and_changes() {
    let h = harness();
    let queue = h.engine.queue();
    register_counting(queue, "note", Ok(()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = queue.subscribe_sync_queue(move |stats| {
        let _ = tx.send(stats);
    });
    assert_eq!(rx.recv().await, Some(QueueStats::default()));

    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();
    let stats = rx.recv().await.unwrap();
    assert_eq!(stats.pending, 1);

    queue.drain_sync_queue().await.unwrap();
    let mut last = stats;
    while last.total() != 0 {
        last = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(last, QueueStats::default());
}

#[tokio::test]
async fn dropped_stats_subscription_stops_delivery() {
    let h = harness();
    let queue = h.engine.queue();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = queue.subscribe_sync_queue(move |stats| {
        let _ = tx.send(stats);
    });
    rx.recv().await.unwrap();
    sub.unsubscribe();

    queue
        .enqueue(TaskType::upsert("note"), json!({}), EnqueueOptions::default())
        .unwrap();
    tokio::task::yield_now().await;
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn interrupted_tasks_are_recovered_on_startup() {
    let h = harness();
    let mut stranded = SyncTask::new(TaskType::upsert("note"), json!({}), None, START_MS - 10);
    stranded.status = TaskStatus::Processing;
    stranded.attempts = 1;
    h.queue_store.insert(&stranded).unwrap();

    let restarted = SyncEngine::with_runtime(
        quiet_config(),
        h.local.clone(),
        h.queue_store.clone(),
        h.remote.clone(),
        h.clock.clone(),
        Arc::new(TokioScheduler),
    )
    .unwrap();

    let task = only_task(restarted.queue());
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert!(task.is_due(START_MS));
}

#[tokio::test]
async fn write_made_before_restart_is_pushed_after_it() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let local_path = dir.path().join("local.db");
    let queue_path = dir.path().join("queue.db");
    let clock = Arc::new(ManualClock::new(START_MS));
    let remote = Arc::new(MemoryRemote::new());

    let open_engine = || {
        let engine = SyncEngine::with_runtime(
            quiet_config(),
            Arc::new(SqliteStore::open(&local_path).unwrap()),
            QueueStore::open(&queue_path).unwrap(),
            remote.clone(),
            clock.clone(),
            Arc::new(TokioScheduler),
        )
        .unwrap();
        engine.register_entity(EntityBinding::new("invoice", "invoices"));
        engine
    };

    {
        let engine = open_engine();
        engine
            .local_first()
            .create("invoice", "A", json!({"amount": 7}))
            .unwrap();
        assert_eq!(remote.commits(), 0);
    }

    let restarted = open_engine();
    assert_eq!(restarted.queue().stats().pending, 1);
    assert_eq!(restarted.flush().await.unwrap(), 1);

    let doc = remote.document("invoices", "A").unwrap();
    assert_eq!(doc["amount"], json!(7));
    assert_eq!(remote.commits(), 1);
    assert_eq!(restarted.queue().stats().total(), 0);

    let local = restarted
        .local_first()
        .read("invoice", Some("A"))
        .await
        .unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].data["amount"], json!(7));
}
