//! Records: field-name-to-[`Value`] maps with one designated primary-key
//! field, plus an immutable view used when a store is configured
//! `immutable`.

use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A record is a mapping from field name to value. Structural equality
/// (`PartialEq`) compares fields, not identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self { fields: IndexMap::new() }
    }

    pub fn from_fields(fields: IndexMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.shift_remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.fields
    }

    /// Returns the value of the designated primary-key field, if present
    /// and non-null.
    pub fn primary_key(&self, key_field: &str) -> Option<String> {
        match self.fields.get(key_field) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v.to_index_string()),
        }
    }

    /// Merges `other`'s fields on top of `self`'s, keeping `self`'s value
    /// for any field `other` does not set. This is the default `set`
    /// merge semantics: old value merged with new unless `override` is
    /// requested.
    pub fn merge_from(&mut self, other: &Record) {
        for (k, v) in other.fields.iter() {
            self.fields.insert(k.clone(), v.clone());
        }
    }
}

/// A reference-counted, immutable snapshot of a [`Record`].
///
/// Returned by `get` when a store is constructed with `immutable: true`.
/// Because it only exposes shared references, there is no API surface
/// through which a caller could mutate the stored value: a deeply
/// frozen view realized as Rust's ordinary shared-borrow discipline over
/// an `Arc`, not as runtime-checked immutability.
#[derive(Debug, Clone)]
pub struct Frozen(Arc<Record>);

impl Frozen {
    pub fn new(record: Record) -> Self {
        Self(Arc::new(record))
    }

    pub fn from_arc(record: Arc<Record>) -> Self {
        Self(record)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        self.0.fields()
    }

    /// Produces an owned, independently mutable copy.
    pub fn to_owned_record(&self) -> Record {
        (*self.0).clone()
    }

    pub fn as_record(&self) -> &Record {
        &self.0
    }
}

impl PartialEq for Frozen {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl PartialEq<Record> for Frozen {
    fn eq(&self, other: &Record) -> bool {
        &*self.0 == other
    }
}

/// What a read returns from a store constructed with `immutable: true`
/// versus the default: a shared [`Frozen`] view with no copy, or an
/// owned, independently mutable [`Record`].
#[derive(Debug, Clone)]
pub enum RecordHandle {
    Owned(Record),
    Frozen(Frozen),
}

impl RecordHandle {
    pub fn as_record(&self) -> &Record {
        match self {
            RecordHandle::Owned(r) => r,
            RecordHandle::Frozen(f) => f.as_record(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_record().get(field)
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, RecordHandle::Frozen(_))
    }

    /// Produces an owned, independently mutable copy regardless of which
    /// variant this is.
    pub fn into_owned(self) -> Record {
        match self {
            RecordHandle::Owned(r) => r,
            RecordHandle::Frozen(f) => f.to_owned_record(),
        }
    }
}

impl PartialEq for RecordHandle {
    fn eq(&self, other: &Self) -> bool {
        self.as_record() == other.as_record()
    }
}

impl PartialEq<Record> for RecordHandle {
    fn eq(&self, other: &Record) -> bool {
        self.as_record() == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unset_fields() {
        let mut base = Record::new();
        base.set("name", Value::from("alice"));
        base.set("age", Value::Int(30));

        let mut patch = Record::new();
        patch.set("age", Value::Int(31));

        base.merge_from(&patch);
        assert_eq!(base.get("name"), Some(&Value::from("alice")));
        assert_eq!(base.get("age"), Some(&Value::Int(31)));
    }

    #[test]
    fn primary_key_is_none_when_field_missing_or_null() {
        let mut r = Record::new();
        assert_eq!(r.primary_key("id"), None);
        r.set("id", Value::Null);
        assert_eq!(r.primary_key("id"), None);
        r.set("id", Value::from("r1"));
        assert_eq!(r.primary_key("id"), Some("r1".to_string()));
    }

    #[test]
    fn frozen_view_shares_storage_but_cannot_mutate_it() {
        let mut r = Record::new();
        r.set("x", Value::Int(1));
        let frozen = Frozen::new(r.clone());
        let mut owned = frozen.to_owned_record();
        owned.set("x", Value::Int(2));
        assert_eq!(frozen.get("x"), Some(&Value::Int(1)));
        assert_eq!(owned.get("x"), Some(&Value::Int(2)));
    }
}
