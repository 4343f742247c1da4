//! The tagged value model carried by all configuration and step data.
//!
//! Every piece of configuration-borne data — globals, step parameters,
//! step results — is a [`Value`]. JSON maps onto the variants 1:1 with one
//! exception: [`Value::Object`] (a typed record) is never produced by
//! parsing; it only arises from registry projection at resolution time,
//! and serializes back as a `{"className": …, "object": …}` map.

use std::collections::HashMap;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A dynamically-typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The single absence sentinel. Dotted-path traversal, missing map
    /// keys, and empty step returns all collapse to this.
    None,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// A typed record produced by projecting a map through a registered
    /// class descriptor.
    Object {
        class_name: String,
        fields: HashMap<String, Value>,
    },
}

/// Runtime kind of a [`Value`], used for declared-argument checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    None,
    Boolean,
    Integer,
    Float,
    String,
    List,
    Map,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::None => "none",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Object => "object",
        };
        f.write_str(s)
    }
}

impl ValueKind {
    /// Whether a value of kind `actual` may be passed where `self` is
    /// declared. Absence is accepted everywhere; integers widen to float.
    pub fn accepts(&self, actual: ValueKind) -> bool {
        actual == ValueKind::None
            || *self == actual
            || (*self == ValueKind::Float && actual == ValueKind::Integer)
    }
}

impl Value {
    pub const NONE: Value = Value::None;

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Object { .. } => ValueKind::Object,
        }
    }

    /// Emptiness per the skip rules: absent, empty string, empty list, or
    /// empty map. Everything else (including `false` and `0`) is non-empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::None => true,
            Value::String(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            _ => false,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Scalar check: embedded `${…}` concatenation only renders scalars.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Boolean(_) | Value::Integer(_) | Value::Float(_) | Value::String(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up a single key in a map or typed-object value.
    pub fn get(&self, key: &str) -> &Value {
        match self {
            Value::Map(m) => m.get(key).unwrap_or(&Value::NONE),
            Value::Object { fields, .. } => fields.get(key).unwrap_or(&Value::NONE),
            _ => &Value::NONE,
        }
    }

    /// Descend a dotted path. Each segment looks into the current map or
    /// object; absence at any segment terminates the walk with absence.
    pub fn get_path<'a, I>(&self, segments: I) -> &Value
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut current = self;
        for seg in segments {
            current = current.get(seg);
            if current.is_none() {
                return &Value::NONE;
            }
        }
        current
    }

    /// Render a scalar for embedded concatenation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::None => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::json!(*i),
            Value::Float(f) => serde_json::json!(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Object { class_name, fields } => {
                let object: serde_json::Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::json!({ "className": class_name, "object": object })
            }
        }
    }

    /// Convenience constructor for map values.
    pub fn map<I>(entries: I) -> Value
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Value::Map(entries.into_iter().collect())
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_plain_values() {
        let json = serde_json::json!({
            "name": "metalus",
            "count": 3,
            "ratio": 0.5,
            "enabled": true,
            "tags": ["a", "b"],
            "nested": { "inner": null }
        });
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn kind_reports_variant() {
        assert_eq!(Value::Integer(1).kind(), ValueKind::Integer);
        assert_eq!(Value::String("x".into()).kind(), ValueKind::String);
        assert_eq!(Value::None.kind(), ValueKind::None);
    }

    #[test]
    fn emptiness_rules() {
        assert!(Value::None.is_empty());
        assert!(Value::String(String::new()).is_empty());
        assert!(Value::List(vec![]).is_empty());
        assert!(Value::Map(HashMap::new()).is_empty());
        assert!(!Value::Boolean(false).is_empty());
        assert!(!Value::Integer(0).is_empty());
        assert!(!Value::String("0".into()).is_empty());
    }

    #[test]
    fn get_path_descends_maps_and_objects() {
        let value = Value::map([(
            "outer".to_string(),
            Value::Object {
                class_name: "com.acme.Inner".into(),
                fields: [("field".to_string(), Value::Integer(7))].into_iter().collect(),
            },
        )]);
        assert_eq!(value.get_path(["outer", "field"]), &Value::Integer(7));
    }

    #[test]
    fn get_path_absence_short_circuits() {
        let value = Value::map([("a".to_string(), Value::None)]);
        assert_eq!(value.get_path(["a", "b", "c"]), &Value::None);
        assert_eq!(value.get_path(["missing"]), &Value::None);
        assert_eq!(Value::Integer(1).get_path(["x"]), &Value::None);
    }

    #[test]
    fn object_serializes_as_descriptor() {
        let obj = Value::Object {
            class_name: "com.acme.Widget".into(),
            fields: [("size".to_string(), Value::Integer(2))].into_iter().collect(),
        };
        assert_eq!(
            obj.to_json(),
            serde_json::json!({ "className": "com.acme.Widget", "object": { "size": 2 } })
        );
    }

    #[test]
    fn float_widening_accepted() {
        assert!(ValueKind::Float.accepts(ValueKind::Integer));
        assert!(!ValueKind::Integer.accepts(ValueKind::Float));
        assert!(ValueKind::String.accepts(ValueKind::None));
    }

    #[test]
    fn display_string_for_scalars() {
        assert_eq!(Value::Integer(42).to_display_string(), "42");
        assert_eq!(Value::Boolean(true).to_display_string(), "true");
        assert_eq!(Value::String("hi".into()).to_display_string(), "hi");
        assert_eq!(Value::None.to_display_string(), "");
    }
}
