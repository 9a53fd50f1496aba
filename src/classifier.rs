//! Length-based anomaly classification of submitted form fields.
//!
//! A submission is anomalous when any value is longer than the configured
//! maximum. Oversized values are never kept verbatim: they are replaced by a
//! `<field>_length` entry holding the character count.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Suffix appended to the name of an oversized field.
pub const LENGTH_SUFFIX: &str = "_length";

/// A stored field value: either the submitted text or, for oversized
/// fields, its length in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Raw(String),
    Length(u64),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Raw(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Raw(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Length(value)
    }
}

/// Insertion-ordered map of field name to [`FieldValue`]. Serialises as a
/// JSON object with keys in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap(Vec<(String, FieldValue)>);

impl FieldMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace a field. A replaced field keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for FieldMap
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldMapVisitor;

        impl<'de> Visitor<'de> for FieldMapVisitor {
            type Value = FieldMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of string or integer values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMap, A::Error> {
                let mut map = FieldMap::new();
                while let Some((k, v)) = access.next_entry::<String, FieldValue>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(FieldMapVisitor)
    }
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Every value fits; the submission is kept as-is.
    Normal(FieldMap),
    /// At least one value is oversized. `flagged` lists the offending
    /// field names in submission order.
    Anomalous {
        data: FieldMap,
        flagged: Vec<String>,
    },
}

impl Classification {
    pub fn is_anomalous(&self) -> bool {
        matches!(self, Classification::Anomalous { .. })
    }

    pub fn data(&self) -> &FieldMap {
        match self {
            Classification::Normal(data) => data,
            Classification::Anomalous { data, .. } => data,
        }
    }

    pub fn into_data(self) -> FieldMap {
        match self {
            Classification::Normal(data) => data,
            Classification::Anomalous { data, .. } => data,
        }
    }
}

/// Length of a value in Unicode scalar values, not bytes.
pub fn value_length(value: &str) -> u64 {
    value.chars().count() as u64
}

/// Partition `fields` against `max_len`.
///
/// Anomalous data lists the `<field>_length` entries first, then the
/// untouched fields, each group in submission order. If an untouched field
/// happens to be named like a length entry, the length entry wins.
pub fn classify(fields: &[(String, String)], max_len: u64) -> Classification {
    let flagged: Vec<(&str, u64)> = fields
        .iter()
        .map(|(k, v)| (k.as_str(), value_length(v)))
        .filter(|(_, len)| *len > max_len)
        .collect();

    if flagged.is_empty() {
        let data = fields.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        return Classification::Normal(data.collect());
    }

    let mut data = FieldMap::new();
    for (name, len) in &flagged {
        data.insert(format!("{name}{LENGTH_SUFFIX}"), *len);
    }
    for (name, value) in fields {
        if flagged.iter().any(|(f, _)| *f == name.as_str()) || data.contains_key(name) {
            continue;
        }
        data.insert(name.as_str(), value.as_str());
    }

    let flagged = flagged.into_iter().map(|(name, _)| name.to_owned());
    Classification::Anomalous {
        data,
        flagged: flagged.collect(),
    }
}
