//! Decimal-exact scaling helpers
//!
//! Factors and offsets are kept as `Decimal` so that `raw * 0.1` is exactly
//! `60.0` and never `60.00000000000001`.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serializer};

/// Parse a decimal from its textual form, accepting exponent notation
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// Convert an `f64` to a decimal through its shortest round-trip text
///
/// `0.1_f64` becomes exactly `0.1`, not the binary approximation.
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    parse_decimal(&value.to_string())
}

/// Convert a JSON scalar (number or numeric string) to a decimal
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => parse_decimal(&n.to_string()),
        serde_json::Value::String(s) => parse_decimal(s),
        serde_json::Value::Bool(b) => Some(Decimal::from(*b as u8)),
        _ => None,
    }
}

/// Format a decimal as a clean JSON number
///
/// Integral values are emitted as integers, everything else as the nearest `f64`.
pub fn to_json_number(value: Decimal) -> serde_json::Value {
    let value = value.normalize();
    if value.fract().is_zero() {
        if let Some(i) = value.to_i64() {
            return serde_json::json!(i);
        }
    }
    match value.to_f64() {
        Some(f) => serde_json::json!(f),
        None => serde_json::Value::String(value.to_string()),
    }
}

/// Number of decimal places implied by a factor (0.1 → 1, 0.25 → 2, 5 → 0)
pub fn precision_from_factor(factor: Decimal) -> u32 {
    factor.normalize().scale()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Serde adapter for `Decimal` fields written as YAML/JSON numbers or strings
pub mod serde_decimal {
    use super::*;

    pub fn serialize<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.normalize().to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let parsed = match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Int(i) => Some(Decimal::from(i)),
            NumberOrString::Float(f) => decimal_from_f64(f),
            NumberOrString::Text(s) => parse_decimal(&s),
        };
        parsed.ok_or_else(|| serde::de::Error::custom("expected a decimal number"))
    }
}
