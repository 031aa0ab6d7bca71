//! Record CRUD and index-backed lookups driven through the `Database`
//! façade: composite indexes, array-field indexes, and unique
//! constraints.

use pretty_assertions::assert_eq;
use rusty_store::{Database, IndexSpec, QueryOptions, Record, ReadOptions, SetOptions, StoreConfig, Value};

fn rec(fields: &[(&str, Value)]) -> Record {
    let mut r = Record::new();
    for (k, v) in fields {
        r.set(*k, v.clone());
    }
    r
}

#[test]
fn set_with_no_key_assigns_a_fresh_uuid_to_the_primary_key_field() {
    let db = Database::new(StoreConfig::default()).unwrap();
    let stored = db.set(None, rec(&[("name", Value::from("ada"))]), SetOptions::default()).unwrap();
    let key = stored.primary_key("id").expect("auto-assigned id");
    assert!(db.has(&key));
    assert_eq!(db.get(&key, ReadOptions::default()).unwrap().get("name"), Some(&Value::from("ada")));
}

#[test]
fn set_merges_onto_the_prior_record_unless_override_is_requested() {
    let db = Database::new(StoreConfig::default()).unwrap();
    db.set(Some("u1".into()), rec(&[("name", Value::from("ada")), ("age", Value::Int(30))]), SetOptions::default()).unwrap();

    let merged = db.set(Some("u1".into()), rec(&[("age", Value::Int(31))]), SetOptions::default()).unwrap();
    assert_eq!(merged.get("name"), Some(&Value::from("ada")));
    assert_eq!(merged.get("age"), Some(&Value::Int(31)));

    let overridden = db.set(Some("u1".into()), rec(&[("age", Value::Int(40))]), SetOptions { override_existing: true, transaction: None, ..Default::default() }).unwrap();
    assert_eq!(overridden.get("name"), None);
}

#[test]
fn delete_of_an_absent_key_is_an_error() {
    let db = Database::new(StoreConfig::default()).unwrap();
    assert!(db.delete("missing", SetOptions::default()).is_err());
}

#[test]
fn composite_index_lookup_matches_exactly_one_record() {
    let mut config = StoreConfig::default();
    config.delimiter = "|".to_string();
    config.index.push(IndexSpec::new("by_region_tier", vec!["region".to_string(), "tier".to_string()]));
    let db = Database::new(config).unwrap();

    db.set(Some("a".into()), rec(&[("region", Value::from("eu")), ("tier", Value::from("gold"))]), SetOptions::default()).unwrap();
    db.set(Some("b".into()), rec(&[("region", Value::from("eu")), ("tier", Value::from("silver"))]), SetOptions::default()).unwrap();
    db.set(Some("c".into()), rec(&[("region", Value::from("us")), ("tier", Value::from("gold"))]), SetOptions::default()).unwrap();

    let found = db
        .find(&[("region".to_string(), Value::from("eu")), ("tier".to_string(), Value::from("gold"))], QueryOptions::default())
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("tier"), Some(&Value::from("gold")));
}

#[test]
fn array_field_index_matches_on_any_element() {
    let mut config = StoreConfig::default();
    config.index.push(IndexSpec::new("by_tag", vec!["tags".to_string()]));
    let db = Database::new(config).unwrap();
    db.set(Some("r1".into()), rec(&[("tags", Value::Array(vec![Value::from("t1"), Value::from("t2")]))]), SetOptions::default()).unwrap();

    let by_t1 = db.find(&[("tags".to_string(), Value::from("t1"))], QueryOptions::default()).unwrap();
    let by_t2 = db.find(&[("tags".to_string(), Value::from("t2"))], QueryOptions::default()).unwrap();
    assert_eq!(by_t1.len(), 1);
    assert_eq!(by_t2.len(), 1);
}

#[test]
fn unique_violation_leaves_the_store_unchanged() {
    let mut config = StoreConfig::default();
    config.index.push(IndexSpec::new("email_idx", vec!["email".to_string()]).unique(true));
    let db = Database::new(config).unwrap();

    db.set(Some("r1".into()), rec(&[("email", Value::from("a@x"))]), SetOptions::default()).unwrap();
    let err = db.set(Some("r2".into()), rec(&[("email", Value::from("a@x"))]), SetOptions::default());
    assert!(err.is_err());
    assert!(!db.has("r2"));
}

#[test]
fn find_with_no_matching_index_falls_back_to_a_full_scan_without_erroring() {
    let db = Database::new(StoreConfig::default()).unwrap();
    db.set(Some("a".into()), rec(&[("color", Value::from("red"))]), SetOptions::default()).unwrap();
    let found = db.find(&[("color".to_string(), Value::from("red"))], QueryOptions::default()).unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn a_partial_index_never_hides_records_its_filter_rejects_from_find() {
    let mut config = StoreConfig::default();
    config.index.push(
        IndexSpec::new("premium_by_tier", vec!["tier".to_string()])
            .filter(std::sync::Arc::new(|r: &Record| matches!(r.get("tier"), Some(Value::String(t)) if t == "premium"))),
    );
    let db = Database::new(config).unwrap();
    db.set(Some("p".into()), rec(&[("tier", Value::from("premium"))]), SetOptions::default()).unwrap();
    db.set(Some("b".into()), rec(&[("tier", Value::from("basic"))]), SetOptions::default()).unwrap();

    // "basic" records are absent from the partial index, so the lookup
    // must degrade to a scan rather than return nothing.
    let basics = db.find(&[("tier".to_string(), Value::from("basic"))], QueryOptions::default()).unwrap();
    assert_eq!(basics.len(), 1);
}

#[test]
fn where_runs_a_predicate_across_every_record() {
    let db = Database::new(StoreConfig::default()).unwrap();
    for i in 0..5i64 {
        db.set(Some(format!("r{i}")), rec(&[("n", Value::Int(i))]), SetOptions::default()).unwrap();
    }
    let evens = db.where_(|r| matches!(r.get("n"), Some(Value::Int(n)) if *n % 2 == 0), QueryOptions::default());
    assert_eq!(evens.len(), 3);
}
