//! In-memory data tables.
//!
//! Variable values, function parameters/results and event payloads are all
//! tables: an ordered list of records, each a map of field name to JSON
//! value. The wire encoding is left to a [`TableCodec`](crate::codec::TableCodec).
//!
//! # Example
//!
//! ```
//! use aggwire_client::table::{DataTable, Record};
//!
//! let table = DataTable::single(Record::new().with("name", "admin").with("enabled", true));
//! assert_eq!(table.rec().and_then(|r| r.string("name")), Some("admin"));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of a [`DataTable`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// String field; `null` and missing read as `None`.
    pub fn string(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Boolean field, also accepting `"true"`/`"false"` strings.
    pub fn boolean(&self, field: &str) -> Option<bool> {
        match self.0.get(field)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Integer field, also accepting numeric strings.
    pub fn int(&self, field: &str) -> Option<i64> {
        match self.0.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer field that fits an `i32`; out-of-range values read as `None`.
    pub fn int32(&self, field: &str) -> Option<i32> {
        self.int(field).and_then(|v| i32::try_from(v).ok())
    }

    /// Millisecond field as a duration; zero and negative read as `None`.
    pub fn duration_ms(&self, field: &str) -> Option<Duration> {
        self.int(field)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    /// Nested table field.
    pub fn table(&self, field: &str) -> Option<DataTable> {
        serde_json::from_value(self.0.get(field)?.clone()).ok()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Ordered list of records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataTable {
    #[serde(default)]
    records: Vec<Record>,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(record: Record) -> Self {
        Self {
            records: vec![record],
        }
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// First record.
    pub fn rec(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record whose string `field` equals `value`.
    pub fn select(&self, field: &str, value: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.string(field) == Some(value))
    }
}

impl<'a> IntoIterator for &'a DataTable {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<Record> for DataTable {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let rec = Record::new()
            .with("name", "v1")
            .with("readable", "true")
            .with("writable", false)
            .with("ttl", 1500)
            .with("level", "3")
            .with("none", Value::Null);

        assert_eq!(rec.string("name"), Some("v1"));
        assert_eq!(rec.boolean("readable"), Some(true));
        assert_eq!(rec.boolean("writable"), Some(false));
        assert_eq!(rec.duration_ms("ttl"), Some(Duration::from_millis(1500)));
        assert_eq!(rec.int("level"), Some(3));
        assert_eq!(rec.int32("level"), Some(3));
        assert_eq!(Record::new().with("big", i64::MAX).int32("big"), None);
        assert_eq!(rec.string("none"), None);
        assert_eq!(rec.string("missing"), None);
    }

    #[test]
    fn test_zero_duration_is_none() {
        assert_eq!(Record::new().with("ttl", 0).duration_ms("ttl"), None);
    }

    #[test]
    fn test_select_and_rec() {
        let table: DataTable = ["a", "b", "c"]
            .iter()
            .map(|n| Record::new().with("name", *n))
            .collect();
        assert_eq!(table.len(), 3);
        assert_eq!(table.rec().and_then(|r| r.string("name")), Some("a"));
        assert!(table.select("name", "b").is_some());
        assert!(table.select("name", "z").is_none());
    }

    #[test]
    fn test_nested_table() {
        let inner = DataTable::single(Record::new().with("x", 1));
        let rec = Record::new().with("inner", serde_json::to_value(&inner).unwrap());
        assert_eq!(rec.table("inner"), Some(inner));
    }
}
