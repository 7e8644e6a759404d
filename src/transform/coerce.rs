//! Type coercion of vendor values and passthrough fields.

use std::fmt;
use std::str::FromStr;

use crate::models::{parse_timestamp, FieldValue};

// ---

/// Data type named by a `[fields] <label>=<type>` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Float,
    Str,
    DateTime,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFieldType(pub String);

impl fmt::Display for UnknownFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown field type '{}'", self.0)
    }
}

impl std::error::Error for UnknownFieldType {}

impl FromStr for FieldType {
    type Err = UnknownFieldType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "int" | "integer" => Ok(FieldType::Int),
            "float" | "double" => Ok(FieldType::Float),
            "str" | "string" | "text" => Ok(FieldType::Str),
            "datetime" | "timestamp" => Ok(FieldType::DateTime),
            "bool" | "boolean" => Ok(FieldType::Bool),
            other => Err(UnknownFieldType(other.to_string())),
        }
    }
}

impl FieldType {
    /// Check that `text` is a valid value of this type.
    ///
    /// Blank text always passes, it is a known-empty value rather than a
    /// malformed one.
    pub fn check(&self, text: &str) -> Result<(), String> {
        // ---
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let ok = match self {
            FieldType::Int => text.parse::<i64>().is_ok(),
            FieldType::Float => text.parse::<f64>().is_ok(),
            FieldType::Str => true,
            FieldType::DateTime => parse_timestamp(text).is_some(),
            FieldType::Bool => matches!(
                text.to_lowercase().as_str(),
                "true" | "false" | "1" | "0" | "yes" | "no"
            ),
        };
        if ok {
            Ok(())
        } else {
            Err(format!("'{}' is not a valid {:?}", text, self))
        }
    }
}

/// Numeric value of a measurement.
///
/// `Ok(None)` for blank values, `Err` for text that is not a number.
pub fn coerce_value(value: &FieldValue) -> Result<Option<f64>, String> {
    // ---
    if value.is_blank() {
        return Ok(None);
    }
    match value.as_f64() {
        Some(v) if v.is_finite() => Ok(Some(v)),
        Some(v) => Err(format!("non-finite value {}", v)),
        None => Err(format!("'{}' is not numeric", value)),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_field_type_names() {
        // ---
        assert_eq!("int".parse::<FieldType>(), Ok(FieldType::Int));
        assert_eq!("Float".parse::<FieldType>(), Ok(FieldType::Float));
        assert_eq!("datetime".parse::<FieldType>(), Ok(FieldType::DateTime));
        assert!("complex".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_check_accepts_blank() {
        // ---
        assert!(FieldType::Int.check("  ").is_ok());
        assert!(FieldType::Int.check("12").is_ok());
        assert!(FieldType::Int.check("1.5").is_err());
        assert!(FieldType::DateTime.check("2024-01-01T00:00:00Z").is_ok());
        assert!(FieldType::Bool.check("maybe").is_err());
    }

    #[test]
    fn test_coerce_value() {
        // ---
        assert_eq!(coerce_value(&FieldValue::Text(" 4.5 ".into())), Ok(Some(4.5)));
        assert_eq!(coerce_value(&FieldValue::Int(3)), Ok(Some(3.0)));
        assert_eq!(coerce_value(&FieldValue::Null), Ok(None));
        assert!(coerce_value(&FieldValue::Text("n/a".into())).is_err());
    }
}
