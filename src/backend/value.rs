//! Document model shared by every store implementation

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Field value inside a stored document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(Document),
    /// Write-only sentinel: the store replaces it with its own clock at commit time.
    ServerTimestamp,
}

/// Field name to value. Ordered so encoded documents are deterministic.
pub type Document = BTreeMap<String, Value>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Document> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Rank of the value's type in cross-type ordering.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Timestamp(_) | Value::ServerTimestamp => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
        }
    }

    /// Total order used when sorting query results.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Double(b)) => (*a as f64).total_cmp(b),
            (Value::Double(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.compare(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Integer(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(fields: Document) -> Self {
        Value::Map(fields)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A stored document as returned by a read.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub fields: Document,
}

/// Predicate on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equal(String, Value),
    /// The field is an array holding the value.
    ArrayContains(String, Value),
}

impl Filter {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Equal(field, want) => doc
                .get(field)
                .is_some_and(|v| v.compare(want) == Ordering::Equal),
            Filter::ArrayContains(field, want) => doc
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.iter().any(|v| v.compare(want) == Ordering::Equal)),
        }
    }
}

/// Conjunction of filters plus ascending order keys.
///
/// Results are ordered by each key in turn, then by document id, so two
/// documents with equal keys always come back in the same relative order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::Equal(field.to_string(), value.into()));
        self
    }

    pub fn where_array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::ArrayContains(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by.push(field.to_string());
        self
    }

    /// Whether a document belongs in the result set. Documents missing an
    /// order key are excluded, as a hosted store would do.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
            && self.order_by.iter().all(|key| doc.contains_key(key))
    }

    pub fn sort(&self, snapshots: &mut [Snapshot]) {
        snapshots.sort_by(|a, b| {
            for key in &self.order_by {
                let ord = match (a.fields.get(key), b.fields.get(key)) {
                    (Some(x), Some(y)) => x.compare(y),
                    (x, y) => x.is_some().cmp(&y.is_some()),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snap(id: &str, fields: Vec<(&str, Value)>) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn test_array_contains_filter() {
        let query = Query::new().where_array_contains("members", "bob");
        let doc = snap(
            "g1",
            vec![("members", Value::Array(vec!["alice".into(), "bob".into()]))],
        );
        assert!(query.matches(&doc.fields));

        let other = snap("g2", vec![("members", Value::Array(vec!["carol".into()]))]);
        assert!(!query.matches(&other.fields));

        // Not an array at all.
        let scalar = snap("g3", vec![("members", "bob".into())]);
        assert!(!query.matches(&scalar.fields));
    }

    #[test]
    fn test_missing_order_key_excluded() {
        let query = Query::new().where_eq("groupId", "g").order_by("timestamp");
        let doc = snap("m1", vec![("groupId", "g".into())]);
        assert!(!query.matches(&doc.fields));
    }

    #[test]
    fn test_sort_ties_broken_by_id() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = t + chrono::Duration::seconds(1);
        let query = Query::new().order_by("timestamp");
        let mut list = vec![
            snap("c", vec![("timestamp", later.into())]),
            snap("b", vec![("timestamp", t.into())]),
            snap("a", vec![("timestamp", t.into())]),
        ];
        query.sort(&mut list);
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cross_type_compare() {
        assert_eq!(Value::Null.compare(&Value::Bool(false)), Ordering::Less);
        assert_eq!(Value::Integer(2).compare(&Value::Double(1.5)), Ordering::Greater);
        assert_eq!(Value::from("a").compare(&Value::Integer(9)), Ordering::Greater);
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<String> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".to_string()));
    }
}
