//! Report model and datagram decoding
//!
//! A report is one status datagram emitted by an XRootD daemon through the
//! `all.report` directive, as relayed by `mpxstats -f cgi`:
//! - fields are joined by `&`, each field is `key=value`
//! - values are integers, floats or opaque strings
//! - keys are not declared up front, consumers must tolerate anything

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Errors raised while decoding a datagram
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("malformed datagram segment {segment:?} in line {line:?}")]
    Malformed { line: String, segment: String },
}

/// Handling of datagram segments that are not `key=value`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedPolicy {
    /// Abort ingestion on the first malformed segment
    #[default]
    FailFast,
    /// Drop the offending segment and keep the rest of the datagram
    Skip,
}

/// A single typed report value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Decode a raw literal, preferring the most specific type
    ///
    /// `"12"` is an integer, `"1.5"` a float, anything else stays a string.
    /// Float literals must contain a digit, so `inf` or `nan` remain strings.
    pub fn parse_literal(raw: &str) -> Self {
        let literal = raw.trim();
        if let Ok(int) = literal.parse::<i64>() {
            return Value::Int(int);
        }
        let has_digit = literal.bytes().any(|b| b.is_ascii_digit());
        let has_word = literal.chars().any(|c| c.is_alphabetic() && c != 'e' && c != 'E');
        if has_digit && !has_word {
            if let Ok(float) = literal.parse::<f64>() {
                return Value::Float(float);
            }
        }
        Value::Str(raw.to_string())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(int) => Some(*int),
            Value::Float(float) if float.fract() == 0.0 => Some(*float as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(int) => Some(*int as f64),
            Value::Float(float) => Some(*float),
            Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Value::Str(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(int) => write!(f, "{}", int),
            // Debug keeps the decimal point on integral floats (`4.0`)
            Value::Float(float) => write!(f, "{:?}", float),
            Value::Str(text) => f.write_str(text),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// Decoded report, iterated in key order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Report {
    fields: BTreeMap<String, Value>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one datagram line
    ///
    /// A trailing line terminator is ignored. Under [`MalformedPolicy::Skip`]
    /// the offending segments are dropped and logged instead of failing.
    pub fn parse(line: &str, policy: MalformedPolicy) -> Result<Self, ReportError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut report = Report::new();

        for segment in line.split('&') {
            let mut parts = segment.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => {
                    report.insert(key, Value::parse_literal(value));
                }
                _ => match policy {
                    MalformedPolicy::FailFast => {
                        return Err(ReportError::Malformed {
                            line: line.to_string(),
                            segment: segment.to_string(),
                        });
                    }
                    MalformedPolicy::Skip => {
                        tracing::warn!(segment, "skipping malformed datagram segment");
                    }
                },
            }
        }

        Ok(report)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Keep only the keys accepted by `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        self.fields.retain(|key, value| keep(key, value));
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Report {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(key, value)| (key.into(), value.into())).collect(),
        }
    }
}

impl IntoIterator for Report {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}
