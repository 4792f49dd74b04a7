use crate::prelude::*;

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

pub const TIME_UPDATED: &str = "time_updated";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Float,
    Text,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn float(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Float,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
        }
    }
}

/// The declared, ordered field list of one device. Built once when the device
/// is constructed and shared by every snapshot it emits.
pub type Schema = Arc<[Field]>;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Float(_) => FieldKind::Float,
            Value::Text(_) => FieldKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Float(_) => None,
            Value::Text(s) => Some(s),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

// {{{ Snapshot
/// A complete set of telemetry for one device at one instant.
///
/// There is no way to build a partially populated snapshot: `Snapshot::new`
/// refuses values that do not line up with the schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    schema: Schema,
    values: Vec<Value>,
}

impl Snapshot {
    pub fn new(schema: Schema, values: Vec<Value>) -> Option<Self> {
        if schema.len() != values.len() {
            return None;
        }
        if schema
            .iter()
            .zip(values.iter())
            .any(|(field, value)| field.kind != value.kind())
        {
            return None;
        }

        Some(Self { schema, values })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema
            .iter()
            .position(|field| field.name == name)
            .map(|i| &self.values[i])
    }

    pub fn time_updated(&self) -> f64 {
        self.get(TIME_UPDATED).and_then(Value::as_f64).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Field, &Value)> {
        self.schema.iter().zip(self.values.iter())
    }
}

impl Serialize for Snapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(&field.name, value)?;
        }
        map.end()
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        vec![Field::float(TIME_UPDATED), Field::float("voltage"), Field::text("grid_state")].into()
    }

    #[test]
    fn refuses_partial_values() {
        assert!(Snapshot::new(schema(), vec![Value::Float(1.0), Value::Float(52.1)]).is_none());
    }

    #[test]
    fn refuses_mismatched_kinds() {
        let values = vec![Value::Float(1.0), Value::Text("52.1".into()), Value::Text("on".into())];
        assert!(Snapshot::new(schema(), values).is_none());
    }

    #[test]
    fn serializes_in_schema_order() {
        let values = vec![Value::Float(1.5), Value::Float(52.1), Value::Text("on".into())];
        let snapshot = Snapshot::new(schema(), values).unwrap();

        assert_eq!(snapshot.time_updated(), 1.5);
        assert_eq!(snapshot.get("grid_state").and_then(Value::as_str), Some("on"));
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"time_updated":1.5,"voltage":52.1,"grid_state":"on"}"#
        );
    }
}
