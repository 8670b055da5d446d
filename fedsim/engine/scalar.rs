use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Value carried in metric and config maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Free text.
    Str(String),
}

impl Scalar {
    /// Numeric view; booleans and strings are not numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// Non-negative integer view. Floats are accepted when integral.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(value) => u64::try_from(*value).ok(),
            Self::Float(value) if value.fract() == 0.0 && *value >= 0.0 => Some(*value as u64),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value:.4}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        Self::from(value as u64)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Metrics reported by participants or produced by aggregation.
pub type MetricMap = IndexMap<String, Scalar>;

/// Per-round instructions sent to participants.
pub type ConfigMap = IndexMap<String, Scalar>;

/// Builds a map from key/value pairs.
#[must_use]
pub fn scalar_map<K, V, I>(entries: I) -> IndexMap<String, Scalar>
where
    K: Into<String>,
    V: Into<Scalar>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// Renders a map as `key=value` pairs for tables and logs.
#[must_use]
pub fn format_map(map: &IndexMap<String, Scalar>) -> String {
    map.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_views() {
        assert_eq!(Scalar::Int(3).as_f64(), Some(3.0));
        assert_eq!(Scalar::Float(2.0).as_u64(), Some(2));
        assert_eq!(Scalar::Float(2.5).as_u64(), None);
        assert_eq!(Scalar::Int(-1).as_u64(), None);
        assert_eq!(Scalar::Str("x".into()).as_f64(), None);
    }

    #[test]
    fn untagged_json_shape() {
        let map = scalar_map([("accuracy", Scalar::from(0.5)), ("round", Scalar::from(2_u64))]);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"accuracy":0.5,"round":2}"#);
        let back: MetricMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back["round"], Scalar::Int(2));
        assert_eq!(format_map(&back), "accuracy=0.5000 round=2");
    }
}
