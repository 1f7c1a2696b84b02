use rusqlite::{Connection, params};
use serde_json::json;
use tempfile::TempDir;

use aviary_sync::{
    core::queue::{MutationQueue, QueueError},
    mutation::MutationDraft,
    persist::{QueueSink, sqlite::SqliteQueueSink},
    types::MutationStatus,
};

fn open(path: &std::path::Path) -> MutationQueue {
    let sink = SqliteQueueSink::open(path).expect("open sqlite");
    MutationQueue::open(Box::new(sink)).expect("load queue")
}

#[test]
fn queue_survives_reopen_in_order() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("queue.db");

    let (first, second, third, failed) = {
        let mut queue = open(&db_path);
        let first = queue
            .enqueue(MutationDraft::update("birds", "b1", json!({ "name": "Luna2" })), 1)
            .expect("first");
        let second = queue
            .enqueue(MutationDraft::create("eggs", "e1", json!({ "pair": "p1" })), 2)
            .expect("second");
        let third = queue.enqueue(MutationDraft::delete("birds", "b2"), 3).expect("third");
        let failed = queue
            .enqueue(MutationDraft::update("pairs", "p1", json!({ "cage": 4 })), 4)
            .expect("failed");
        queue.mark_failed(&failed, "rejected: cage taken").expect("fail");
        queue.flush().expect("flush");
        (first, second, third, failed)
    };

    let queue = open(&db_path);
    let pending: Vec<_> = queue.list_pending(None).into_iter().map(|r| r.id).collect();
    assert_eq!(pending, vec![first, second, third]);

    let restored = queue.get(&second).expect("second");
    assert_eq!(restored.payload, json!({ "id": "e1", "pair": "p1" }));
    assert_eq!(restored.seq, 2);

    let failed = queue.get(&failed).expect("failed kept");
    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("rejected: cage taken"));
}

#[test]
fn in_flight_record_reopens_as_pending_and_done_is_gone() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("queue.db");

    let (done, interrupted) = {
        let mut queue = open(&db_path);
        let done = queue
            .enqueue(MutationDraft::update("birds", "b1", json!({ "name": "Luna2" })), 1)
            .expect("done");
        let interrupted = queue
            .enqueue(MutationDraft::update("birds", "b2", json!({ "name": "Kiwi" })), 2)
            .expect("interrupted");
        queue.dequeue_next("birds", 3).expect("claim done");
        queue.mark_done(&done).expect("mark done");
        let claimed = queue.dequeue_next("birds", 4).expect("claim").expect("ready");
        assert_eq!(claimed.id, interrupted);
        (done, interrupted)
    };

    let mut queue = open(&db_path);
    assert!(queue.get(&done).is_none());
    let restored = queue.get(&interrupted).expect("restored");
    assert_eq!(restored.status, MutationStatus::Pending);
    assert_eq!(restored.last_attempt_at, Some(4));

    let reclaimed = queue.dequeue_next("birds", 5).expect("dequeue").expect("ready");
    assert_eq!(reclaimed.id, interrupted);

    let next = queue
        .enqueue(MutationDraft::update("birds", "b3", json!({ "name": "Pip" })), 6)
        .expect("enqueue after reopen");
    assert!(queue.get(&next).expect("next").seq > reclaimed.seq);
}

#[test]
fn sink_rows_follow_queue_transitions() {
    let sink = SqliteQueueSink::open_in_memory().expect("open");
    let mut queue = MutationQueue::open(Box::new(sink)).expect("load");
    let id = queue
        .enqueue(MutationDraft::create("birds", "tmp-1", json!({ "name": "Kiwi" })), 1)
        .expect("create");
    let update = queue
        .enqueue(MutationDraft::update("birds", "tmp-1", json!({ "ring": "R1" })), 2)
        .expect("update");
    queue.dequeue_next("birds", 3).expect("claim");
    queue.mark_done_remapped(&id, Some("srv-1")).expect("done");

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get(&update).expect("update").target_id, "srv-1");
}

#[test]
fn remapped_targets_are_persisted() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("queue.db");

    let update = {
        let mut queue = open(&db_path);
        let create = queue
            .enqueue(MutationDraft::create("birds", "tmp-1", json!({ "name": "Kiwi" })), 1)
            .expect("create");
        let update = queue
            .enqueue(MutationDraft::update("birds", "tmp-1", json!({ "ring": "R1" })), 2)
            .expect("update");
        queue.dequeue_next("birds", 3).expect("claim");
        queue.mark_done_remapped(&create, Some("srv-1")).expect("done");
        update
    };

    let sink = SqliteQueueSink::open(&db_path).expect("reopen");
    assert_eq!(sink.count().expect("count"), 1);
    let stored = sink.load_all().expect("load");
    assert_eq!(stored[0].id, update);
    assert_eq!(stored[0].target_id, "srv-1");
}

#[test]
fn unsupported_envelope_version_fails_to_load() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("queue.db");
    drop(SqliteQueueSink::open(&db_path).expect("create schema"));

    let conn = Connection::open(&db_path).expect("raw open");
    conn.execute(
        "INSERT INTO mutations(id, seq, collection, target_id, status, enqueued_at_ms, payload)
         VALUES (?1, 1, 'birds', 'b1', 'pending', 1, ?2)",
        params![
            "00000000-0000-0000-0000-000000000001",
            br#"{"format_version":99,"record":{}}"#.to_vec()
        ],
    )
    .expect("insert raw row");
    drop(conn);

    let sink = SqliteQueueSink::open(&db_path).expect("reopen");
    let err = MutationQueue::open(Box::new(sink)).expect_err("version 99 is unknown");
    assert!(matches!(err, QueueError::Persist(_)));
}
