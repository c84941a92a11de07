use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid value: {}", .0.to_lowercase())]
    InvalidValue(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// DA and TM null sentinels used by upstream exporters for "no date recorded"
const DA_NULL: &str = "00000000";
const TM_NULL: &str = "000000";

// support hyphens as well, just in case that format is used as input, even though it's not
// compliant with the DICOM standard
const DATE_SUPPORTED_FORMATS: [&str; 2] = ["%Y%m%d", "%Y-%m-%d"];

/// A single element of a flat tag record: the value representation and the value
/// as found in the DICOM JSON model, e.g. `{"vr": "CS", "Value": ["MR"]}`.
///
/// The value is kept opaque (`serde_json::Value`); tag parsing happens upstream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TagElement {
    pub vr: String,

    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl TagElement {
    pub fn new(vr: impl Into<String>, value: Value) -> Self {
        Self {
            vr: vr.into(),
            value: Some(value),
        }
    }

    pub fn empty(vr: impl Into<String>) -> Self {
        Self {
            vr: vr.into(),
            value: None,
        }
    }

    /// A value is missing when it is absent, JSON null, or an empty array.
    pub fn is_missing(&self) -> bool {
        match &self.value {
            None | Some(Value::Null) => true,
            Some(Value::Array(items)) => items.is_empty(),
            Some(_) => false,
        }
    }

    /// First item of the value array, or the value itself for non-array values.
    pub fn first(&self) -> Option<&Value> {
        match &self.value {
            Some(Value::Array(items)) => items.first(),
            Some(Value::Null) | None => None,
            Some(other) => Some(other),
        }
    }
}

/// A flat per-image tag record: DICOM keyword to [`TagElement`].
///
/// Backed by a `BTreeMap` so that serialization and iteration order are
/// deterministic regardless of insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct TagRecord(pub BTreeMap<String, TagElement>);

impl TagRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: impl Into<String>, element: TagElement) -> Option<TagElement> {
        self.0.insert(keyword.into(), element)
    }

    pub fn get(&self, keyword: &str) -> Option<&TagElement> {
        self.0.get(keyword)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First value of a keyword, skipping absent and null elements.
    pub fn first(&self, keyword: &str) -> Option<&Value> {
        self.get(keyword).and_then(TagElement::first)
    }

    pub fn first_str(&self, keyword: &str) -> Option<&str> {
        self.first(keyword).and_then(Value::as_str)
    }

    /// First value as integer, accepting both JSON numbers and numeric strings
    /// (DICOM IS values are frequently exported as strings).
    pub fn first_i64(&self, keyword: &str) -> Option<i64> {
        match self.first(keyword)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn first_f64(&self, keyword: &str) -> Option<f64> {
        match self.first(keyword)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Canonical string form of a JSON value, used for all consensus equality
/// comparison. Strings are rendered without quotes so that `1` and `"1"`
/// collapse; composite values are compared by their JSON serialization.
///
/// Limitation: this equality is lossy for composite values, which is accepted.
pub fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Canonical form of a whole element value, or `None` when the value is missing.
pub fn canonical_element(element: &TagElement) -> Option<String> {
    if element.is_missing() {
        return None;
    }
    element.value.as_ref().map(|value| match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical).collect();
            parts.join("\\")
        }
        other => canonical(other),
    })
}

/// Parse a DICOM DA value. The `00000000` sentinel parses to `None`.
pub fn parse_da(da: &str) -> Result<Option<NaiveDate>> {
    if da == DA_NULL {
        return Ok(None);
    }
    DATE_SUPPORTED_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(da, format).ok())
        .map(Some)
        .ok_or_else(|| Error::InvalidValue(format!("unable to parse date from {da}")))
}

/// Parse a DICOM TM value, with or without a fractional part.
pub fn parse_tm(tm: &str) -> Result<NaiveTime> {
    let format = if tm.contains('.') { "%H%M%S%.f" } else { "%H%M%S" };
    NaiveTime::parse_from_str(tm, format)
        .map_err(|_| Error::InvalidValue(format!("unable to parse time from {tm}")))
}

/// Parse a DA + TM pair into a datetime. Returns `None` when both carry their
/// null sentinels, mirroring how upstream exporters mark "no date recorded".
pub fn parse_da_tm(da: &str, tm: &str) -> Result<Option<NaiveDateTime>> {
    if da == DA_NULL && tm == TM_NULL {
        return Ok(None);
    }
    let date = parse_da(da)?
        .ok_or_else(|| Error::InvalidValue(format!("date {da} is null but time {tm} is not")))?;
    let time = parse_tm(tm)?;
    Ok(Some(NaiveDateTime::new(date, time)))
}

/// Parse a DICOM AS (age string) value in years, e.g. `"045Y"`.
pub fn parse_as_years(age: &str) -> Result<u32> {
    match age.strip_suffix('Y') {
        Some(years) => years
            .parse()
            .map_err(|_| Error::InvalidValue(format!("unable to parse age from {age}"))),
        None => Err(Error::InvalidValue(format!("age {age} is not in years"))),
    }
}
