//! Per-key version history driven through the `Database` façade: enabling
//! versioning, retention trimming, and what the kept history looks like
//! after repeated updates.

use pretty_assertions::assert_eq;
use rusty_store::{Database, OperationTag, Record, RetentionPolicy, SetOptions, StoreConfig, Value};

fn rec(v: i64) -> Record {
    let mut r = Record::new();
    r.set("v", Value::Int(v));
    r
}

#[test]
fn count_retention_keeps_the_three_most_recent_preimages() {
    let mut config = StoreConfig::default();
    config.versioning = true;
    config.retention_policy = RetentionPolicy::Count(3);
    let db = Database::new(config).unwrap();

    for v in 0..5 {
        db.set(Some("r1".into()), rec(v), SetOptions { override_existing: true, transaction: None, ..Default::default() }).unwrap();
    }

    assert_eq!(db.version_manager().history_len("r1"), 3);
    let kept: Vec<i64> = db
        .version_manager()
        .versions_in_range("r1", None, None)
        .iter()
        .map(|e| match e.data.get("v") {
            Some(Value::Int(i)) => *i,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(kept, vec![1, 2, 3]);
}

#[test]
fn a_fresh_key_has_no_history_until_a_second_write_creates_a_preimage() {
    let mut config = StoreConfig::default();
    config.versioning = true;
    let db = Database::new(config).unwrap();

    db.set(Some("r1".into()), rec(1), SetOptions::default()).unwrap();
    assert_eq!(db.version_manager().history_len("r1"), 0);

    db.set(Some("r1".into()), rec(2), SetOptions { override_existing: true, transaction: None, ..Default::default() }).unwrap();
    assert_eq!(db.version_manager().history_len("r1"), 1);
    assert_eq!(db.version_manager().latest("r1").unwrap().data.get("v"), Some(&Value::Int(1)));
}

#[test]
fn deleting_a_versioned_key_appends_a_delete_tagged_entry() {
    let mut config = StoreConfig::default();
    config.versioning = true;
    let db = Database::new(config).unwrap();

    db.set(Some("r1".into()), rec(1), SetOptions::default()).unwrap();
    db.delete("r1", SetOptions::default()).unwrap();

    let latest = db.version_manager().latest("r1").unwrap();
    assert_eq!(latest.operation, OperationTag::Delete);
}
