//! Records - opaque JSON objects keyed by a numeric identifier
//!
//! The remote source returns each record as a JSON object. Nothing in the
//! pipeline interprets its fields except `id`, which keys the snapshot, the
//! seen-set and the store.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Field holding the record identifier
pub const ID_FIELD: &str = "id";

/// A single record as returned by the remote source
pub type Record = Map<String, Value>;

/// Reasons an identifier cannot be resolved from a record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("record has no 'id' field")]
    Missing,

    #[error("cannot parse '{value}' as an integer identifier")]
    Unparseable { value: String },

    #[error("identifier {value} does not fit in a 64-bit integer")]
    OutOfRange { value: String },

    #[error("unsupported identifier type: {kind}")]
    UnsupportedType { kind: &'static str },
}

/// Resolve the 64-bit identifier of a record
///
/// Accepts JSON integers, base-10 numeric strings and floats. Floats are
/// truncated toward zero.
pub fn extract_id(record: &Record) -> Result<i64, IdError> {
    let raw = record.get(ID_FIELD).ok_or(IdError::Missing)?;

    match raw {
        Value::Number(n) => {
            if let Some(id) = n.as_i64() {
                Ok(id)
            } else if n.is_u64() {
                Err(IdError::OutOfRange {
                    value: n.to_string(),
                })
            } else {
                let f = n.as_f64().ok_or_else(|| IdError::Unparseable {
                    value: n.to_string(),
                })?;
                float_to_id(f)
            }
        }
        Value::String(s) => s.parse::<i64>().map_err(|_| IdError::Unparseable {
            value: s.clone(),
        }),
        Value::Null => Err(IdError::UnsupportedType { kind: "null" }),
        Value::Bool(_) => Err(IdError::UnsupportedType { kind: "bool" }),
        Value::Array(_) => Err(IdError::UnsupportedType { kind: "array" }),
        Value::Object(_) => Err(IdError::UnsupportedType { kind: "object" }),
    }
}

fn float_to_id(f: f64) -> Result<i64, IdError> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
    if !f.is_finite() || f < i64::MIN as f64 || f >= i64::MAX as f64 {
        return Err(IdError::OutOfRange {
            value: f.to_string(),
        });
    }
    Ok(f.trunc() as i64)
}

/// Records of one collection merged by identifier
///
/// Last write wins. Iteration is in ascending identifier order.
#[derive(Debug, Default, Clone)]
pub struct CollectionSnapshot {
    records: BTreeMap<i64, Record>,
}

impl CollectionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a page of records, returning how many were dropped for lack of
    /// a usable identifier
    pub fn merge(&mut self, items: Vec<Record>) -> usize {
        let mut dropped = 0;
        for item in items {
            match extract_id(&item) {
                Ok(id) => {
                    self.records.insert(id, item);
                }
                Err(e) => {
                    warn!("Dropping record without usable identifier: {}", e);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&Record> {
        self.records.get(&id)
    }

    /// Consume the snapshot into records ordered by ascending identifier
    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_extract_id_integer() {
        assert_eq!(extract_id(&record(json!({"id": 123}))), Ok(123));
        assert_eq!(extract_id(&record(json!({"id": -7}))), Ok(-7));
    }

    #[test]
    fn test_extract_id_float() {
        assert_eq!(extract_id(&record(json!({"id": 789.0}))), Ok(789));
        assert_eq!(extract_id(&record(json!({"id": 12.9}))), Ok(12));
    }

    #[test]
    fn test_extract_id_numeric_string() {
        assert_eq!(extract_id(&record(json!({"id": "101112"}))), Ok(101112));
    }

    #[test]
    fn test_extract_id_bad_string() {
        assert_eq!(
            extract_id(&record(json!({"id": "abc"}))),
            Err(IdError::Unparseable {
                value: "abc".to_string()
            })
        );
        // No trimming, same as a strict integer parse
        assert!(extract_id(&record(json!({"id": " 42"}))).is_err());
    }

    #[test]
    fn test_extract_id_missing() {
        assert_eq!(
            extract_id(&record(json!({"name": "test"}))),
            Err(IdError::Missing)
        );
    }

    #[test]
    fn test_extract_id_unsupported_types() {
        assert_eq!(
            extract_id(&record(json!({"id": true}))),
            Err(IdError::UnsupportedType { kind: "bool" })
        );
        assert_eq!(
            extract_id(&record(json!({"id": null}))),
            Err(IdError::UnsupportedType { kind: "null" })
        );
        assert_eq!(
            extract_id(&record(json!({"id": [1]}))),
            Err(IdError::UnsupportedType { kind: "array" })
        );
    }

    #[test]
    fn test_extract_id_out_of_range() {
        assert!(matches!(
            extract_id(&record(json!({"id": u64::MAX}))),
            Err(IdError::OutOfRange { .. })
        ));
        assert!(matches!(
            extract_id(&record(json!({"id": 1e300}))),
            Err(IdError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_snapshot_last_write_wins() {
        let mut snapshot = CollectionSnapshot::new();
        snapshot.merge(vec![record(json!({"id": 5, "v": "first"}))]);
        snapshot.merge(vec![record(json!({"id": 5, "v": "second"}))]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(5).unwrap()["v"], "second");
    }

    #[test]
    fn test_snapshot_drops_records_without_id() {
        let mut snapshot = CollectionSnapshot::new();
        let dropped = snapshot.merge(vec![
            record(json!({"id": 1})),
            record(json!({"name": "orphan"})),
            record(json!({"id": "x"})),
        ]);

        assert_eq!(dropped, 2);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_snapshot_orders_by_id() {
        let mut snapshot = CollectionSnapshot::new();
        snapshot.merge(vec![
            record(json!({"id": 30})),
            record(json!({"id": "10"})),
            record(json!({"id": 20.0})),
        ]);

        let ids: Vec<i64> = snapshot
            .into_records()
            .iter()
            .map(|r| extract_id(r).unwrap())
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[quickcheck]
    fn prop_snapshot_has_one_record_per_distinct_id(pages: Vec<Vec<i16>>) -> bool {
        let mut snapshot = CollectionSnapshot::new();
        let mut distinct = std::collections::HashSet::new();

        for page in &pages {
            let items = page.iter().map(|id| record(json!({"id": id}))).collect();
            snapshot.merge(items);
            distinct.extend(page.iter().map(|id| *id as i64));
        }

        let ids: Vec<i64> = snapshot
            .into_records()
            .iter()
            .map(|r| extract_id(r).unwrap())
            .collect();
        ids.len() == distinct.len() && ids.windows(2).all(|w| w[0] < w[1])
    }
}
