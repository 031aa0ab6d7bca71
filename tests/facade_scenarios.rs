//! Whole-store scenarios that cut across components: batch atomicity and
//! the dump/override round trip.

use pretty_assertions::assert_eq;
use rusty_store::{BatchOp, Database, DumpKind, Record, SetOptions, StoreConfig, Value};

fn rec(v: i64) -> Record {
    let mut r = Record::new();
    r.set("v", Value::Int(v));
    r
}

#[test]
fn batch_in_atomic_mode_rolls_back_every_write_on_a_later_failure() {
    let mut config = StoreConfig::default();
    config.index.push(rusty_store::IndexSpec::new("email_idx", vec!["email".to_string()]).unique(true));
    let db = Database::new(config).unwrap();
    db.set(Some("existing".into()), {
        let mut r = Record::new();
        r.set("email", Value::from("dup@x"));
        r
    }, SetOptions::default()).unwrap();

    let mut conflicting = Record::new();
    conflicting.set("email", Value::from("dup@x"));

    let ops = vec![
        BatchOp::Set { key: Some("a".into()), data: rec(1) },
        BatchOp::Set { key: Some("b".into()), data: conflicting },
    ];

    let result = db.batch(ops, true, None);
    assert!(result.is_err());
    assert!(!db.has("a"));
    assert!(!db.has("b"));
}

#[test]
fn batch_in_non_atomic_mode_collects_individual_failures() {
    let db = Database::new(StoreConfig::default()).unwrap();
    let ops = vec![
        BatchOp::Set { key: Some("a".into()), data: rec(1) },
        BatchOp::Delete { key: "missing".into() },
        BatchOp::Set { key: Some("c".into()), data: rec(3) },
    ];

    let results = db.batch(ops, false, None).unwrap();
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
    assert!(db.has("a"));
    assert!(db.has("c"));
}

#[test]
fn dump_indexes_and_override_restores_bucket_contents() {
    let mut config = StoreConfig::default();
    config.index.push(rusty_store::IndexSpec::new("by_v", vec!["v".to_string()]));
    let db = Database::new(config).unwrap();
    db.set(Some("a".into()), rec(1), SetOptions::default()).unwrap();
    db.set(Some("b".into()), rec(2), SetOptions::default()).unwrap();

    let dump = db.dump(DumpKind::Indexes);
    let mut fresh_config = StoreConfig::default();
    fresh_config.index.push(rusty_store::IndexSpec::new("by_v", vec!["v".to_string()]));
    let fresh = Database::new(fresh_config).unwrap();
    fresh.override_store(dump).unwrap();

    let hits = fresh.index_manager().find_by_index("by_v", "1").unwrap();
    assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
}

#[test]
fn dump_records_and_override_store_round_trips_state() {
    let db = Database::new(StoreConfig::default()).unwrap();
    for i in 0..3 {
        db.set(Some(format!("r{i}")), rec(i), SetOptions::default()).unwrap();
    }

    let dump = db.dump(DumpKind::Records);
    let fresh = Database::new(StoreConfig::default()).unwrap();
    fresh.override_store(dump).unwrap();

    for i in 0..3 {
        let key = format!("r{i}");
        assert_eq!(fresh.get(&key, Default::default()).unwrap(), db.get(&key, Default::default()).unwrap());
    }
}
