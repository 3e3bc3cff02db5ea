//! # URL Converters and View Arguments
//!
//! Typed conversion for the `<converter:name>` placeholders of URL rules.
//! The router depends on `convert_param`, not on the individual converters.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered view arguments, as matched from the URL or supplied for building
pub type ViewArgs = IndexMap<String, ParamValue>;

/// Supported URL converters
///
/// Default is `String`, which matches one path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    /// One path segment, no conversion
    #[default]
    String,
    /// Integer segment, parses to i64
    Int,
    /// Float segment, parses to f64
    Float,
    /// Boolean segment, "true"/"false" or "1"/"0"
    Bool,
    /// Rest of the path, slashes included
    Path,
}

impl ParamType {
    /// Parse converter name from a rule placeholder (e.g. "int" in `<int:id>`)
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` for an unknown converter.
    pub fn from_specifier(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "string" | "default" => Ok(Self::String),
            "int" | "integer" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" | "boolean" => Ok(Self::Bool),
            "path" => Ok(Self::Path),
            other => Err(Error::InvalidRoutePattern {
                pattern: s.to_string(),
                reason: format!("the converter '{other}' does not exist"),
            }),
        }
    }

    /// Get the converter name for error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Path => "path",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// A view argument, either matched from the URL or supplied to `url_for`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// `string` and `path` segments
    String(String),
    /// `int` segments
    Int(i64),
    /// `float` segments
    Float(f64),
    /// `bool` segments
    Bool(bool),
}

impl ParamValue {
    /// Render the value as it appears in a URL
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    /// Text of a string argument
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Value of an `int` argument
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Value of a `float` argument
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Convert raw URL text to a typed value
///
/// # Errors
///
/// Returns `Error::InvalidRoutePattern` if conversion fails.
pub fn convert_param(raw: &str, param_type: ParamType) -> Result<ParamValue> {
    let invalid = |kind: &str| Error::InvalidRoutePattern {
        pattern: raw.to_string(),
        reason: format!("Cannot convert '{raw}' to {kind}"),
    };
    match param_type {
        ParamType::String => {
            if raw.contains('/') {
                Err(invalid("string segment"))
            } else {
                Ok(ParamValue::String(raw.to_string()))
            }
        }
        ParamType::Path => Ok(ParamValue::String(raw.to_string())),
        ParamType::Int => raw
            .parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|_| invalid("integer")),
        ParamType::Float => raw
            .parse::<f64>()
            .map(ParamValue::Float)
            .map_err(|_| invalid("float")),
        ParamType::Bool => match raw.to_lowercase().as_str() {
            "true" | "1" => Ok(ParamValue::Bool(true)),
            "false" | "0" => Ok(ParamValue::Bool(false)),
            _ => Err(invalid("boolean")),
        },
    }
}

/// Parse a rule segment placeholder into name and converter
///
/// - `<id>` -> ("id", String)
/// - `<int:id>` -> ("id", Int)
/// - `<path:rest>` -> ("rest", Path)
///
/// Returns `Ok(None)` for a static segment.
///
/// # Errors
///
/// Returns `Error::InvalidRoutePattern` for a malformed placeholder or unknown converter.
pub fn parse_param_pattern(segment: &str) -> Result<Option<(String, ParamType)>> {
    if !(segment.starts_with('<') && segment.ends_with('>')) {
        if segment.contains('<') || segment.contains('>') {
            return Err(Error::InvalidRoutePattern {
                pattern: segment.to_string(),
                reason: "placeholders must span a whole path segment".to_string(),
            });
        }
        return Ok(None);
    }

    let inner = &segment[1..segment.len() - 1];
    let (converter, name) = match inner.split_once(':') {
        Some((converter, name)) => (ParamType::from_specifier(converter.trim())?, name.trim()),
        None => (ParamType::String, inner.trim()),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(Error::InvalidRoutePattern {
            pattern: segment.to_string(),
            reason: format!("invalid variable name '{name}'"),
        });
    }

    Ok(Some((name.to_string(), converter)))
}
