use change_buffer::{BufferQueue, ChangeOperation, NewEntry};
use tempfile::tempdir;

fn new_entry(table: &str, pk: &str, op: ChangeOperation) -> NewEntry {
    NewEntry::with_json_payload(
        table,
        op,
        pk,
        &serde_json::json!({ "primary_key": pk }),
        Some(100),
    )
    .unwrap()
}

#[test]
fn queue_persists_entries_and_ack_flow() {
    let dir = tempdir().unwrap();
    let queue_path = dir.path().join("buffer").join("changes.db");
    let queue = BufferQueue::open(&queue_path).unwrap();

    let mut ids = Vec::new();
    for idx in 0..3 {
        let entry = new_entry("book", &format!("pk-{idx}"), ChangeOperation::Insert);
        ids.push(queue.push("testdb", &entry).unwrap());
    }

    let batch = queue.fetch_batch("testdb", 10).unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].entry_id, ids[0]);
    assert_eq!(batch[1].primary_key, "pk-1");

    queue.ack_up_to("testdb", ids[0]).unwrap();
    let batch = queue.fetch_batch("testdb", 10).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].entry_id, ids[1]);

    let removed = queue.vacuum_acknowledged().unwrap();
    assert_eq!(removed, 1);
    drop(queue);

    // Reopen to ensure durability.
    let queue = BufferQueue::open(&queue_path).unwrap();
    let batch = queue.fetch_batch("testdb", 10).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].entry_id, ids[1]);
    let payload: serde_json::Value = batch[0].json_payload().unwrap().unwrap();
    assert_eq!(payload["primary_key"], "pk-1");
}

#[test]
fn fetch_batch_respects_limit_and_order() {
    let dir = tempdir().unwrap();
    let queue = BufferQueue::open(dir.path().join("limit.db")).unwrap();
    for idx in 0..5 {
        queue
            .push(
                "testdb",
                &new_entry("book", &format!("pk-{idx}"), ChangeOperation::Delete),
            )
            .unwrap();
    }

    let batch = queue.fetch_batch("testdb", 2).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].primary_key, "pk-0");
    assert_eq!(batch[1].operation, ChangeOperation::Delete);
    assert_eq!(queue.pending_count("testdb").unwrap(), 5);
}
