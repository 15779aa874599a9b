//! Field-level diffs between two entity states.
//!
//! Outbound changes carry a diff from the ghost snapshot to the current local
//! state. Diffs are computed over the top-level fields of the entity's JSON
//! object; a changed field is sent whole.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Operation on a single top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "o", content = "v")]
pub enum FieldOp {
    /// Field absent from the base
    #[serde(rename = "+")]
    Insert(Value),
    /// Field absent from the target
    #[serde(rename = "-")]
    Remove,
    /// Field present in both with different values
    #[serde(rename = "r")]
    Replace(Value),
}

/// Map of field name to the operation that turns base into target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff {
    fields: BTreeMap<String, FieldOp>,
}

impl Diff {
    /// Compute the diff turning `base` into `target`.
    ///
    /// Non-object values are treated as empty objects.
    pub fn between(base: &Value, target: &Value) -> Self {
        let empty = Map::new();
        let base = base.as_object().unwrap_or(&empty);
        let target = target.as_object().unwrap_or(&empty);

        let mut fields = BTreeMap::new();
        for (key, value) in target {
            match base.get(key) {
                None => {
                    fields.insert(key.clone(), FieldOp::Insert(value.clone()));
                }
                Some(old) if old != value => {
                    fields.insert(key.clone(), FieldOp::Replace(value.clone()));
                }
                Some(_) => {}
            }
        }
        for key in base.keys() {
            if !target.contains_key(key) {
                fields.insert(key.clone(), FieldOp::Remove);
            }
        }

        Self { fields }
    }

    /// Apply this diff to `base`, producing the target object.
    pub fn apply(&self, base: &Value) -> Value {
        let mut object = base.as_object().cloned().unwrap_or_default();
        for (key, op) in &self.fields {
            match op {
                FieldOp::Insert(value) | FieldOp::Replace(value) => {
                    object.insert(key.clone(), value.clone());
                }
                FieldOp::Remove => {
                    object.remove(key);
                }
            }
        }
        Value::Object(object)
    }

    pub fn get(&self, field: &str) -> Option<&FieldOp> {
        self.fields.get(field)
    }

    /// Value a field will hold after the diff, if it is set by it.
    pub fn value_of(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field)? {
            FieldOp::Insert(value) | FieldOp::Replace(value) => Some(value),
            FieldOp::Remove => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_values_have_empty_diff() {
        let v = json!({"content": "a", "tags": ["x"]});
        assert!(Diff::between(&v, &v).is_empty());
    }

    #[test]
    fn detects_insert_replace_remove() {
        let base = json!({"content": "a", "deleted": false, "shareURL": ""});
        let target = json!({"content": "ab", "deleted": false, "tags": ["x"]});
        let diff = Diff::between(&base, &target);

        assert_eq!(diff.get("content"), Some(&FieldOp::Replace(json!("ab"))));
        assert_eq!(diff.get("tags"), Some(&FieldOp::Insert(json!(["x"]))));
        assert_eq!(diff.get("shareURL"), Some(&FieldOp::Remove));
        assert_eq!(diff.get("deleted"), None);
        assert_eq!(diff.len(), 3);
    }

    #[test]
    fn apply_reaches_target() {
        let base = json!({"content": "a", "shareURL": ""});
        let target = json!({"content": "ab", "tags": []});
        let diff = Diff::between(&base, &target);
        assert_eq!(diff.apply(&base), target);
    }

    #[test]
    fn null_base_is_empty_object() {
        let target = json!({"name": "Work"});
        let diff = Diff::between(&Value::Null, &target);
        assert_eq!(diff.value_of("name"), Some(&json!("Work")));
        assert_eq!(diff.apply(&Value::Null), target);
    }

    #[test]
    fn wire_format() {
        let diff = Diff::between(&json!({"a": 1, "b": 2}), &json!({"a": 3, "c": 4}));
        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(
            json,
            json!({
                "a": {"o": "r", "v": 3},
                "b": {"o": "-"},
                "c": {"o": "+", "v": 4}
            })
        );
        let parsed: Diff = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, diff);
    }
}
