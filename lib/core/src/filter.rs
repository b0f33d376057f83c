// Document query language evaluated against JSON documents
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

pub trait Filter {
    fn matches(&self, doc: &Value) -> bool;
}

/// A single predicate over a dotted field path.
///
/// Paths descend through objects and fan out over arrays, so
/// `phoneNumbers.normalizedValue` matches when any phone number qualifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FilterCondition {
    Equals { field: String, value: Value },
    /// Case-insensitive string equality
    EqualsPrimary { field: String, value: String },
    NotEquals { field: String, value: Value },
    GreaterThan { field: String, value: f64 },
    LessThan { field: String, value: f64 },
    GreaterEqual { field: String, value: f64 },
    LessEqual { field: String, value: f64 },
    Prefix { field: String, value: String },
    Contains { field: String, value: String },
    And { conditions: Vec<FilterCondition> },
    Or { conditions: Vec<FilterCondition> },
    Not { condition: Box<FilterCondition> },
}

impl FilterCondition {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterCondition::Equals { field: field.into(), value: value.into() }
    }

    pub fn equals_primary(field: impl Into<String>, value: impl Into<String>) -> Self {
        FilterCondition::EqualsPrimary { field: field.into(), value: value.into() }
    }

    pub fn greater_than(field: impl Into<String>, value: f64) -> Self {
        FilterCondition::GreaterThan { field: field.into(), value }
    }

    pub fn prefix(field: impl Into<String>, value: impl Into<String>) -> Self {
        FilterCondition::Prefix { field: field.into(), value: value.into() }
    }

    fn matches_condition(condition: &FilterCondition, doc: &Value) -> bool {
        match condition {
            FilterCondition::Equals { field, value } => {
                resolve_path(doc, field).iter().any(|v| *v == value)
            }
            FilterCondition::EqualsPrimary { field, value } => {
                let wanted = value.to_lowercase();
                resolve_path(doc, field)
                    .iter()
                    .filter_map(|v| v.as_str())
                    .any(|v| v.to_lowercase() == wanted)
            }
            FilterCondition::NotEquals { field, value } => {
                !resolve_path(doc, field).iter().any(|v| *v == value)
            }
            FilterCondition::GreaterThan { field, value } => {
                numeric_any(doc, field, |v| v > *value)
            }
            FilterCondition::LessThan { field, value } => {
                numeric_any(doc, field, |v| v < *value)
            }
            FilterCondition::GreaterEqual { field, value } => {
                numeric_any(doc, field, |v| v >= *value)
            }
            FilterCondition::LessEqual { field, value } => {
                numeric_any(doc, field, |v| v <= *value)
            }
            FilterCondition::Prefix { field, value } => resolve_path(doc, field)
                .iter()
                .filter_map(|v| v.as_str())
                .any(|v| v.starts_with(value.as_str())),
            FilterCondition::Contains { field, value } => resolve_path(doc, field)
                .iter()
                .filter_map(|v| v.as_str())
                .any(|v| v.contains(value.as_str())),
            FilterCondition::And { conditions } => {
                conditions.iter().all(|c| Self::matches_condition(c, doc))
            }
            FilterCondition::Or { conditions } => {
                conditions.iter().any(|c| Self::matches_condition(c, doc))
            }
            FilterCondition::Not { condition } => !Self::matches_condition(condition, doc),
        }
    }
}

impl Filter for FilterCondition {
    fn matches(&self, doc: &Value) -> bool {
        Self::matches_condition(self, doc)
    }
}

fn numeric_any(doc: &Value, field: &str, pred: impl Fn(f64) -> bool) -> bool {
    resolve_path(doc, field)
        .iter()
        .filter_map(|v| v.as_f64())
        .any(pred)
}

/// Collect every value reachable at `path`, flattening arrays along the way.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(segment) {
                            push_flattened(&mut next, v);
                        }
                    }
                }
                other => {
                    if let Some(v) = other.get(segment) {
                        push_flattened(&mut next, v);
                    }
                }
            }
        }
        current = next;
    }
    current
}

fn push_flattened<'a>(out: &mut Vec<&'a Value>, value: &'a Value) {
    match value {
        Value::Array(items) if items.iter().all(|i| !i.is_object()) => out.extend(items.iter()),
        other => out.push(other),
    }
}

/// A find query against one document kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub from: String,
    #[serde(default, rename = "where")]
    pub filter: Vec<FilterCondition>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub page: Option<String>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            from: kind.into(),
            filter: Vec::new(),
            order_by: None,
            descending: false,
            limit: None,
            include_deleted: false,
            page: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn filter(mut self, condition: FilterCondition) -> Self {
        self.filter.push(condition);
        self
    }

    #[inline]
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    #[inline]
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[inline]
    #[must_use]
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    #[inline]
    #[must_use]
    pub fn page(mut self, page: Option<String>) -> Self {
        self.page = page;
        self
    }

    /// Ordering key for a document under this query: the order field, then `_id`.
    pub fn sort_key(&self, doc: &Value) -> (Value, String) {
        let field = self
            .order_by
            .as_deref()
            .and_then(|f| resolve_path(doc, f).first().map(|v| (*v).clone()))
            .unwrap_or(Value::Null);
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        (field, id)
    }

    pub fn compare_keys(&self, a: &(Value, String), b: &(Value, String)) -> Ordering {
        let ord = compare_values(&a.0, &b.0).then_with(|| a.1.cmp(&b.1));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl Filter for Query {
    fn matches(&self, doc: &Value) -> bool {
        if doc.get("_kind").and_then(Value::as_str) != Some(self.from.as_str()) {
            return false;
        }
        if !self.include_deleted && doc.get("_del").and_then(Value::as_bool).unwrap_or(false) {
            return false;
        }
        self.filter.iter().all(|c| c.matches(doc))
    }
}

/// Total order over JSON scalars: null < bool < number < string < everything else.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> Value {
        json!({
            "_id": "p1",
            "_kind": "person",
            "_rev": 7,
            "names": [{"givenName": "Ada", "familyName": "Lovelace"}],
            "phoneNumbers": [
                {"value": "555-1234", "normalizedValue": "4321555"},
                {"value": "555-9999", "normalizedValue": "9999555"}
            ],
            "tags": ["a", "b"]
        })
    }

    #[test]
    fn test_path_fans_out_over_arrays() {
        let doc = person();
        let values = resolve_path(&doc, "phoneNumbers.normalizedValue");
        assert_eq!(values.len(), 2);
        assert_eq!(resolve_path(&doc, "tags").len(), 2);
    }

    #[test]
    fn test_primary_collation_is_case_insensitive() {
        let doc = person();
        assert!(FilterCondition::equals_primary("names.familyName", "LOVELACE").matches(&doc));
        assert!(!FilterCondition::equals("names.familyName", "LOVELACE").matches(&doc));
    }

    #[test]
    fn test_prefix_and_numeric() {
        let doc = person();
        assert!(FilterCondition::prefix("phoneNumbers.normalizedValue", "9999").matches(&doc));
        assert!(FilterCondition::greater_than("_rev", 6.0).matches(&doc));
        assert!(!FilterCondition::greater_than("_rev", 7.0).matches(&doc));
    }

    #[test]
    fn test_query_skips_deleted_unless_asked() {
        let mut doc = person();
        doc["_del"] = json!(true);
        let query = Query::new("person");
        assert!(!query.matches(&doc));
        assert!(query.include_deleted(true).matches(&doc));
    }

    #[test]
    fn test_not_and_or() {
        let doc = person();
        let cond = FilterCondition::And {
            conditions: vec![
                FilterCondition::Not {
                    condition: Box::new(FilterCondition::equals("_id", "p2")),
                },
                FilterCondition::Or {
                    conditions: vec![
                        FilterCondition::equals("_id", "zzz"),
                        FilterCondition::equals("tags", "b"),
                    ],
                },
            ],
        };
        assert!(cond.matches(&doc));
    }
}
