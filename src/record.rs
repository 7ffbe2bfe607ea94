//! Validated compound records.
//!
//! Raw property-table rows arrive as loosely typed JSON objects. [`validate_row`]
//! turns one into a [`CompoundRecord`]: the `CID` is mandatory, every other
//! field is coerced to its declared [`ValueKind`] where that is safe and left
//! absent otherwise. One bad field never discards the record.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::identifier::Key;
use crate::properties::{PropertySelection, PropertySpec, Source, ValueKind};

/// Public landing page for a compound.
const COMPOUND_URL_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/compound";

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Text value.
    Text(String),
    /// Floating-point value.
    Float(f64),
    /// Integer value.
    Integer(i64),
    /// List of strings.
    List(Vec<String>),
}

impl PropertyValue {
    /// Returns the text, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the number as `f64` for float and integer values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Returns the integer, if this is an integer value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the list, if this is a list value.
    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(value) => f.write_str(value),
            Self::Float(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::List(values) => f.write_str(&values.join("; ")),
        }
    }
}

/// A row could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The row is not a JSON object.
    #[error("property row is not an object")]
    NotAnObject,

    /// The mandatory `CID` field is missing or unusable.
    #[error("property row has no usable CID")]
    MissingKey,
}

/// A validated property bag for one compound.
///
/// Immutable once built. Properties that do not exist for the compound (or
/// failed coercion) are simply absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompoundRecord {
    key: Key,
    properties: BTreeMap<&'static str, PropertyValue>,
}

impl CompoundRecord {
    /// Creates an empty record for `key`.
    #[must_use]
    pub fn new(key: Key) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
        }
    }

    /// The compound's key.
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Returns a property by canonical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Iterates present properties in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &PropertyValue)> {
        self.properties.iter().map(|(name, value)| (*name, value))
    }

    /// Number of present properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// True when no property is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Molecular weight.
    #[must_use]
    pub fn molecular_weight(&self) -> Option<f64> {
        self.get("molecular_weight").and_then(PropertyValue::as_f64)
    }

    /// Molecular formula.
    #[must_use]
    pub fn molecular_formula(&self) -> Option<&str> {
        self.get("molecular_formula").and_then(PropertyValue::as_text)
    }

    /// Canonical SMILES.
    #[must_use]
    pub fn canonical_smiles(&self) -> Option<&str> {
        self.get("canonical_smiles").and_then(PropertyValue::as_text)
    }

    /// IUPAC name.
    #[must_use]
    pub fn iupac_name(&self) -> Option<&str> {
        self.get("iupac_name").and_then(PropertyValue::as_text)
    }

    /// CAS registry number.
    #[must_use]
    pub fn cas(&self) -> Option<&str> {
        self.get("cas").and_then(PropertyValue::as_text)
    }

    /// Synonyms; empty when none were retrieved.
    #[must_use]
    pub fn synonyms(&self) -> &[String] {
        self.get("synonyms")
            .and_then(PropertyValue::as_list)
            .unwrap_or(&[])
    }

    /// The compound's public web page.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{COMPOUND_URL_BASE}/{}", self.key)
    }

    /// Sets a property. Crate-internal so records stay immutable for callers.
    pub(crate) fn insert(&mut self, name: &'static str, value: PropertyValue) {
        self.properties.insert(name, value);
    }
}

/// Extracts the `CID` from a raw row.
#[must_use]
pub fn row_key(row: &Value) -> Option<Key> {
    let cid = row.get("CID")?;
    let raw = match cid {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    Key::new(raw)
}

/// Validates one property-table row against the selection.
///
/// Special properties are not read from the row; they are attached later
/// with [`attach_special`].
///
/// # Errors
///
/// Returns [`ValidationError`] when the row is not an object or lacks a
/// usable `CID`.
pub fn validate_row(
    row: &Value,
    selection: &PropertySelection,
) -> Result<CompoundRecord, ValidationError> {
    let object = row.as_object().ok_or(ValidationError::NotAnObject)?;
    let key = row_key(row).ok_or(ValidationError::MissingKey)?;

    let mut record = CompoundRecord::new(key);
    for spec in selection.specs() {
        if let Source::Tags(tags) = spec.source
            && let Some(value) = first_valid(object, tags, spec.kind)
        {
            record.insert(spec.name, value);
        }
    }
    Ok(record)
}

/// Attaches an already-coerced special property value.
pub(crate) fn attach_special(
    record: &mut CompoundRecord,
    spec: &'static PropertySpec,
    value: Option<PropertyValue>,
) {
    if let Some(value) = value {
        record.insert(spec.name, value);
    }
}

fn first_valid(object: &Map<String, Value>, tags: &[&str], kind: ValueKind) -> Option<PropertyValue> {
    tags.iter()
        .filter_map(|tag| object.get(*tag))
        .find_map(|raw| coerce(raw, kind))
}

/// Coerces a raw JSON value to `kind`, or `None` when that is not safe.
#[must_use]
pub fn coerce(raw: &Value, kind: ValueKind) -> Option<PropertyValue> {
    match kind {
        ValueKind::Text => match raw {
            Value::String(s) if !s.trim().is_empty() => Some(PropertyValue::Text(s.clone())),
            _ => None,
        },
        ValueKind::Float => match raw {
            Value::Number(n) => n.as_f64().map(PropertyValue::Float),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(PropertyValue::Float),
            _ => None,
        },
        ValueKind::Integer => match raw {
            Value::Number(n) => n.as_i64().or_else(|| integral_f64(n.as_f64()?)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .map(PropertyValue::Integer),
        ValueKind::List => match raw {
            Value::Array(items) => {
                let values: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect();
                (!values.is_empty()).then_some(PropertyValue::List(values))
            }
            _ => None,
        },
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn integral_f64(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15).then(|| value as i64)
}
