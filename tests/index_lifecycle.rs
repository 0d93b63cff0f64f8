mod common;

use std::time::Duration;
use serde_json::json;
use tallydb::core::stats::HealthStatus;
use tallydb::{
    CancelToken, Database, DocId, Document, Error, ErrorKind, FieldValue, IndexQuery, IndexState,
    MapReduceDefinition, MappedRow, Result, Row,
};
use common::WAIT;

/// Sums `Amount` per `Bucket` over the "Entries" collection.
///
/// Entries with `"Poison": true` make map fail and `"Explode": true` make
/// it panic. A negative `Amount` makes reduce fail. Entries with `"SlowMs"`
/// stall the worker for that long.
struct BucketTotals;

impl MapReduceDefinition for BucketTotals {
    fn name(&self) -> &str {
        "BucketTotals"
    }

    fn map(&self, doc: &Document) -> Result<Vec<MappedRow>> {
        if !doc.is_in("Entries") {
            return Ok(Vec::new());
        }
        if doc.body["Poison"].as_bool() == Some(true) {
            return Err(Error::map_reduce("poisoned entry"));
        }
        if doc.body["Explode"].as_bool() == Some(true) {
            panic!("exploding entry {}", doc.id);
        }
        if let Some(ms) = doc.body["SlowMs"].as_u64() {
            std::thread::sleep(Duration::from_millis(ms));
        }
        let mut row = Row::new();
        row.insert("Amount".to_string(), FieldValue::Integer(doc.body["Amount"].as_i64().unwrap_or(0)));
        Ok(vec![MappedRow::new(doc.body["Bucket"].as_str().unwrap_or_default(), row)])
    }

    fn reduce(&self, _key: &str, values: &[Row]) -> Result<Row> {
        let total = values
            .iter()
            .map(|v| match v.get("Amount") {
                Some(FieldValue::Integer(n)) if *n < 0 => Err(Error::map_reduce(format!("negative Amount {}", n))),
                Some(FieldValue::Integer(n)) => Ok(*n),
                other => Err(Error::map_reduce(format!("bad Amount {:?}", other))),
            })
            .sum::<Result<i64>>()?;
        let mut row = Row::new();
        row.insert("Amount".to_string(), FieldValue::Integer(total));
        Ok(row)
    }
}

fn entry(db: &Database, id: &str, bucket: &str, amount: i64) {
    db.put(id, "Entries", json!({ "Bucket": bucket, "Amount": amount })).unwrap();
}

fn amount_of(db: &Database, bucket: &str) -> Option<i64> {
    let results = db.query(&IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(WAIT)).unwrap();
    results.rows.iter().find(|r| r.key == bucket).and_then(|r| match r.get("Amount") {
        Some(FieldValue::Integer(n)) => Some(*n),
        _ => None,
    })
}

#[test]
fn map_failure_corrupts_until_rebuilt() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    entry(&db, "e/1", "a", 5);
    assert_eq!(amount_of(&db, "a"), Some(5));

    // The write itself succeeds; the failure is reported by the index.
    db.put("e/2", "Entries", json!({ "Bucket": "a", "Poison": true })).unwrap();
    let err = db
        .query(&IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(WAIT))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CorruptedIndex);

    let status = db.index_status("BucketTotals").unwrap();
    assert_eq!(status.state, IndexState::Corrupted);
    assert!(status.error.as_deref().unwrap_or_default().contains("poisoned"));
    assert!(!db.health_check().status.is_healthy());
    assert!(matches!(db.health_check().status, HealthStatus::Unhealthy(_)));

    // Reads without waiting fail too rather than returning old rows.
    let err = db.query(&IndexQuery::new("BucketTotals")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::CorruptedIndex);

    // Writes made while corrupted are picked up by the rebuild.
    db.delete(&DocId::new("e/2")).unwrap();
    entry(&db, "e/3", "a", 7);
    db.rebuild_index("BucketTotals", &CancelToken::new()).unwrap();

    assert_eq!(amount_of(&db, "a"), Some(12));
    let status = db.index_status("BucketTotals").unwrap();
    assert_eq!(status.state, IndexState::Idle);
    assert_eq!(status.error, None);
    assert!(db.health_check().status.is_healthy());
}

/// Asserts the index is Corrupted with `message` in its error, that
/// queries fail, and that the checkpoint and rows are those of `last_good`.
fn assert_corrupted_at(db: &Database, last_good: tallydb::Etag, rows: usize, message: &str) {
    let err = db
        .query(&IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(WAIT))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CorruptedIndex);

    let status = db.index_status("BucketTotals").unwrap();
    assert_eq!(status.state, IndexState::Corrupted);
    assert!(status.error.as_deref().unwrap_or_default().contains(message), "{:?}", status.error);
    assert_eq!(status.checkpoint, last_good);
    assert_eq!(status.row_count, rows);
}

#[test]
fn map_panic_corrupts_without_advancing_the_checkpoint() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    entry(&db, "e/1", "a", 5);
    entry(&db, "e/2", "b", 1);
    assert_eq!(amount_of(&db, "a"), Some(5));
    let last_good = db.current_etag();

    db.put("e/3", "Entries", json!({ "Bucket": "a", "Amount": 2, "Explode": true })).unwrap();
    assert_corrupted_at(&db, last_good, 2, "exploding entry e/3");

    // Later writes are not applied on top of the failed one.
    entry(&db, "e/4", "c", 9);
    assert_corrupted_at(&db, last_good, 2, "panicked");

    db.delete(&DocId::new("e/3")).unwrap();
    db.rebuild_index("BucketTotals", &CancelToken::new()).unwrap();
    assert_eq!(amount_of(&db, "c"), Some(9));
    assert_eq!(db.index_status("BucketTotals").unwrap().checkpoint, db.current_etag());
}

#[test]
fn reduce_error_corrupts_without_advancing_the_checkpoint() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    entry(&db, "e/1", "a", 5);
    assert_eq!(amount_of(&db, "a"), Some(5));
    let last_good = db.current_etag();

    // Map accepts the row; reducing group "a" with it fails.
    entry(&db, "e/2", "a", -3);
    assert_corrupted_at(&db, last_good, 1, "negative Amount -3");

    // A rebuild hits the same failure while the entry is still there.
    let err = db.rebuild_index("BucketTotals", &CancelToken::new()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MapReduce);
    assert_eq!(db.index_status("BucketTotals").unwrap().state, IndexState::Corrupted);

    entry(&db, "e/2", "a", 3);
    db.rebuild_index("BucketTotals", &CancelToken::new()).unwrap();
    assert_eq!(amount_of(&db, "a"), Some(8));
}

#[test]
fn cancelled_rebuild_stays_building() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    entry(&db, "e/1", "a", 5);
    assert_eq!(amount_of(&db, "a"), Some(5));

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = db.rebuild_index("BucketTotals", &cancel).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    let status = db.index_status("BucketTotals").unwrap();
    assert_eq!(status.state, IndexState::Building);
    assert!(matches!(db.health_check().status, HealthStatus::Degraded(_)));

    let results = db.query(&IndexQuery::new("BucketTotals")).unwrap();
    assert!(results.is_stale);

    db.rebuild_index("BucketTotals", &CancelToken::new()).unwrap();
    assert_eq!(db.index_status("BucketTotals").unwrap().state, IndexState::Idle);
    assert_eq!(amount_of(&db, "a"), Some(5));
}

#[test]
fn stats_report_documents_and_indexes() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    entry(&db, "e/1", "a", 1);
    entry(&db, "e/2", "b", 2);
    db.put("other/1", "Other", json!({ "Bucket": "a" })).unwrap();
    amount_of(&db, "a");

    let stats = db.stats();
    assert_eq!(stats.document_count, 3);
    assert_eq!(stats.current_etag, db.current_etag());
    assert_eq!(stats.wal_size_bytes, 0);
    assert_eq!(stats.indexes.len(), 1);

    let index = &stats.indexes[0];
    assert_eq!(index.name, "BucketTotals");
    assert_eq!(index.row_count, 2);
    assert_eq!(index.contributing_documents, 2);
    assert!(!index.is_stale());
    assert!(index.last_indexed_at.is_some());
}

#[tokio::test]
async fn wait_times_out_behind_a_slow_index() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    let cancel = CancelToken::new();
    db.query_async(&IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(WAIT), &cancel)
        .await
        .unwrap();

    db.put("e/1", "Entries", json!({ "Bucket": "a", "Amount": 3, "SlowMs": 400 })).unwrap();
    let err = db
        .query_async(
            &IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(Duration::from_millis(20)),
            &cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    // Without waiting the stale rows come back, flagged as stale.
    let stale = db.query_async(&IndexQuery::new("BucketTotals"), &cancel).await.unwrap();
    assert!(stale.is_stale);
    assert!(stale.rows.is_empty());

    let fresh = db
        .query_async(&IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(WAIT), &cancel)
        .await
        .unwrap();
    assert!(!fresh.is_stale);
    assert_eq!(fresh.rows.len(), 1);
}

#[tokio::test]
async fn wait_can_be_cancelled() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    db.put("e/1", "Entries", json!({ "Bucket": "a", "Amount": 3, "SlowMs": 400 })).unwrap();

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = db
        .query_async(&IndexQuery::new("BucketTotals").wait_for_non_stale_results_within(WAIT), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn blocking_query_refuses_to_run_inside_a_runtime() {
    let db = Database::in_memory();
    db.register_index(BucketTotals).unwrap();
    let err = db.query(&IndexQuery::new("BucketTotals")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}
