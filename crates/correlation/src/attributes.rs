//! Scalar attribute values attached to spans and log records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A closed set of scalar attribute types.
///
/// Serialised untagged so a value appears as a plain JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// Ordered key/value bag; the ordering keeps serialisation deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u16> for AttributeValue {
    fn from(v: u16) -> Self {
        Self::Int(v.into())
    }
}

impl From<usize> for AttributeValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_as_plain_scalars() {
        let mut attrs = Attributes::new();
        attrs.insert("db.system".into(), "postgresql".into());
        attrs.insert("db.row_count".into(), 3usize.into());
        attrs.insert("delay.seconds".into(), 0.5.into());
        attrs.insert("error.simulated".into(), true.into());
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(
            json,
            r#"{"db.row_count":3,"db.system":"postgresql","delay.seconds":0.5,"error.simulated":true}"#
        );
    }

    #[test]
    fn deserialises_each_variant() {
        let attrs: Attributes =
            serde_json::from_str(r#"{"a":1,"b":1.5,"c":"x","d":false}"#).unwrap();
        assert_eq!(attrs["a"], AttributeValue::Int(1));
        assert_eq!(attrs["b"], AttributeValue::Float(1.5));
        assert_eq!(attrs["c"], AttributeValue::String("x".into()));
        assert_eq!(attrs["d"], AttributeValue::Bool(false));
    }
}
