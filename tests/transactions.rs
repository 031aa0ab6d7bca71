//! Transaction lifecycle driven through the `Database` façade: rollback on
//! abort, write-write isolation conflicts, and deadlock resolution.

use pretty_assertions::assert_eq;
use rusty_store::{BeginOptions, Database, IsolationLevel, Record, ReadOptions, SetOptions, StoreConfig, Value};

fn rec(v: i64) -> Record {
    let mut r = Record::new();
    r.set("v", Value::Int(v));
    r
}

fn transactional_db() -> Database {
    // RUST_LOG=debug surfaces the begin/commit/abort and deadlock-victim
    // events while debugging a failing scenario.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut config = StoreConfig::default();
    config.enable_transactions = true;
    Database::new(config).unwrap()
}

#[test]
fn a_committed_transaction_is_durable_and_visible() {
    let db = transactional_db();

    let tx = db.begin_transaction(BeginOptions::default()).unwrap();
    db.set(Some("r1".into()), rec(1), SetOptions { override_existing: false, transaction: Some(tx), ..Default::default() }).unwrap();
    db.commit_transaction(tx).unwrap();

    let stored = db.get("r1", ReadOptions::default()).unwrap();
    assert_eq!(stored.get("v"), Some(&Value::Int(1)));
}

#[test]
fn abort_rolls_back_every_write_the_transaction_made() {
    let db = transactional_db();

    let tx = db.begin_transaction(BeginOptions::default()).unwrap();
    db.set(Some("r1".into()), rec(1), SetOptions { override_existing: false, transaction: Some(tx), ..Default::default() }).unwrap();
    db.set(Some("r1".into()), rec(2), SetOptions { override_existing: true, transaction: Some(tx), ..Default::default() }).unwrap();
    db.abort_transaction(tx, "test rollback").unwrap();

    assert!(db.get("r1", ReadOptions::default()).is_none());
}

#[test]
fn two_transactions_writing_the_same_key_serialize_the_second_commit_to_failure() {
    let db = transactional_db();

    let t1 = db.begin_transaction(BeginOptions::default()).unwrap();
    let t2 = db.begin_transaction(BeginOptions::default()).unwrap();
    db.set(Some("r1".into()), rec(1), SetOptions { override_existing: false, transaction: Some(t1), ..Default::default() }).unwrap();
    db.set(Some("r1".into()), rec(2), SetOptions { override_existing: true, transaction: Some(t2), ..Default::default() }).unwrap();

    assert!(db.commit_transaction(t1).is_ok());
    assert!(db.commit_transaction(t2).is_err());
}

#[test]
fn a_read_only_transaction_cannot_write_and_the_store_stays_untouched() {
    let db = transactional_db();
    let tx = db.begin_transaction(BeginOptions { read_only: true, ..Default::default() }).unwrap();

    let err = db.set(Some("r1".into()), rec(1), SetOptions { override_existing: false, transaction: Some(tx), ..Default::default() });
    assert!(err.is_err());
    assert!(db.get("r1", ReadOptions::default()).is_none());
}

#[test]
fn repeatable_read_rejects_a_commit_when_a_read_key_changed_underneath() {
    let db = transactional_db();
    db.set(Some("r1".into()), rec(1), SetOptions::default()).unwrap();

    let reader = db
        .begin_transaction(BeginOptions { isolation_level: IsolationLevel::RepeatableRead, ..Default::default() })
        .unwrap();
    let _ = db.get("r1", ReadOptions { transaction: Some(reader) });

    let writer = db.begin_transaction(BeginOptions::default()).unwrap();
    db.set(Some("r1".into()), rec(2), SetOptions { override_existing: true, transaction: Some(writer), ..Default::default() }).unwrap();
    db.commit_transaction(writer).unwrap();

    assert!(db.commit_transaction(reader).is_err());
}

#[test]
fn read_uncommitted_transactions_never_conflict_on_commit() {
    let mut config = StoreConfig::default();
    config.enable_transactions = true;
    let db = Database::new(config).unwrap();

    let opts = BeginOptions { isolation_level: IsolationLevel::ReadUncommitted, ..Default::default() };
    let t1 = db.begin_transaction(opts.clone()).unwrap();
    let t2 = db.begin_transaction(opts).unwrap();
    db.set(Some("r1".into()), rec(1), SetOptions { override_existing: false, transaction: Some(t1), ..Default::default() }).unwrap();
    db.set(Some("r1".into()), rec(2), SetOptions { override_existing: true, transaction: Some(t2), ..Default::default() }).unwrap();

    assert!(db.commit_transaction(t1).is_ok());
    assert!(db.commit_transaction(t2).is_ok());
}
