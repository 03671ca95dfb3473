//! Signal definitions
//!
//! A signal is a named bit field inside a CAN payload. The definition carries
//! the bit layout, scaling, enumeration table and the free-form metadata the
//! parameter layer interprets (comment tags, access level, raw limits).

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::precision::{parse_decimal, precision_from_factor, serde_decimal};
use crate::types::ByteOrder;

/// Definition of a signal within a CAN frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Signal name, unique within a frame layout
    pub name: String,

    /// Start bit (LSB for little-endian, MSB for big-endian)
    pub start_bit: u16,

    /// Bit length (1..=64)
    #[serde(rename = "length")]
    pub bit_length: u16,

    /// Bit numbering
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Two's complement storage
    #[serde(default)]
    pub signed: bool,

    /// Scale factor: physical = raw * factor + offset
    #[serde(default = "default_factor", with = "serde_decimal")]
    pub factor: Decimal,

    /// Offset: physical = raw * factor + offset
    #[serde(default, with = "serde_decimal")]
    pub offset: Decimal,

    /// Unit string (e.g. "Hz", "V")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Value table for enumerated signals
    #[serde(rename = "enum", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enumeration: BTreeMap<i64, String>,

    /// Minimum raw value declared by the matrix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,

    /// Maximum raw value declared by the matrix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,

    /// Free-form comment; may carry `<tag>` markers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Access level required to write this signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<u32>,

    /// Explicit tags (merged with tags found in the comment)
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

fn default_factor() -> Decimal {
    Decimal::ONE
}

impl Signal {
    /// Create an unscaled little-endian unsigned signal
    pub fn new(name: impl Into<String>, start_bit: u16, bit_length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::Little,
            signed: false,
            factor: Decimal::ONE,
            offset: Decimal::ZERO,
            unit: None,
            enumeration: BTreeMap::new(),
            min: None,
            max: None,
            comment: None,
            access_level: None,
            tags: BTreeSet::new(),
        }
    }

    /// Set the scale factor and offset from their textual decimal form
    pub fn with_scaling(mut self, factor: &str, offset: &str) -> Self {
        self.factor = parse_decimal(factor).unwrap_or(Decimal::ONE);
        self.offset = parse_decimal(offset).unwrap_or(Decimal::ZERO);
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.byte_order = ByteOrder::Big;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_limits(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_enum(mut self, entries: &[(i64, &str)]) -> Self {
        self.enumeration = entries
            .iter()
            .map(|(value, label)| (*value, label.to_string()))
            .collect();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Smallest and largest raw values the storage width can hold
    pub fn raw_bounds(&self) -> (i64, i64) {
        let bits = self.bit_length.clamp(1, 64) as u32;
        if self.signed {
            let half = 1i128 << (bits - 1);
            (
                (-half).max(i64::MIN as i128) as i64,
                (half - 1).min(i64::MAX as i128) as i64,
            )
        } else {
            let max = (1i128 << bits) - 1;
            (0, max.min(i64::MAX as i128) as i64)
        }
    }

    /// Whether a raw value fits the storage width
    pub fn fits(&self, raw: i64) -> bool {
        let (lo, hi) = self.raw_bounds();
        (lo..=hi).contains(&raw)
    }

    /// Fail with `WidthOverflow` when `raw` does not fit
    pub fn check_width(&self, raw: i64) -> CodecResult<()> {
        if self.fits(raw) {
            Ok(())
        } else {
            Err(CodecError::WidthOverflow {
                signal: self.name.clone(),
                value: raw,
                bits: self.bit_length,
                signedness: if self.signed { "signed" } else { "unsigned" },
            })
        }
    }

    /// Payload bit index for every value bit, LSB first
    ///
    /// Payload bit `b` lives in byte `b / 8` at bit `b % 8`.
    pub fn bit_positions(&self) -> Vec<u16> {
        let len = self.bit_length as usize;
        match self.byte_order {
            ByteOrder::Little => (0..self.bit_length).map(|i| self.start_bit + i).collect(),
            ByteOrder::Big => {
                let mut msb_first = Vec::with_capacity(len);
                let mut pos = self.start_bit;
                for i in 0..len {
                    if i > 0 {
                        pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
                    }
                    msb_first.push(pos);
                }
                msb_first.reverse();
                msb_first
            }
        }
    }

    /// Mask of occupied payload bits (payloads are at most 64 bits)
    pub fn occupancy(&self) -> u64 {
        self.bit_positions()
            .into_iter()
            .filter(|&b| b < 64)
            .fold(0u64, |mask, b| mask | (1u64 << b))
    }

    /// Number of payload bytes needed to hold this signal
    pub fn required_bytes(&self) -> usize {
        self.bit_positions()
            .into_iter()
            .max()
            .map(|b| b as usize / 8 + 1)
            .unwrap_or(0)
    }

    /// Write a raw value into the payload
    pub fn insert(&self, raw: i64, payload: &mut [u8]) -> CodecResult<()> {
        self.check_width(raw)?;
        let required = self.required_bytes();
        if payload.len() < required {
            return Err(CodecError::PayloadTooShort {
                expected: required,
                actual: payload.len(),
            });
        }

        let bits = raw as u64;
        for (i, pos) in self.bit_positions().into_iter().enumerate() {
            let byte = &mut payload[pos as usize / 8];
            let mask = 1u8 << (pos % 8);
            if (bits >> i) & 1 == 1 {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        Ok(())
    }

    /// Read the raw value from the payload, `None` if the payload is too short
    pub fn extract(&self, payload: &[u8]) -> Option<i64> {
        if payload.len() < self.required_bytes() {
            return None;
        }

        let mut out: u64 = 0;
        for (i, pos) in self.bit_positions().into_iter().enumerate() {
            if (payload[pos as usize / 8] >> (pos % 8)) & 1 == 1 {
                out |= 1u64 << i;
            }
        }

        let n = self.bit_length.min(64);
        if self.signed && n > 0 && n < 64 && (out >> (n - 1)) & 1 == 1 {
            out |= !((1u64 << n) - 1);
        }
        Some(out as i64)
    }

    /// Raw → physical
    pub fn to_physical(&self, raw: i64) -> Decimal {
        Decimal::from(raw) * self.factor + self.offset
    }

    /// Physical → raw, rounding half away from zero
    pub fn to_raw(&self, physical: Decimal) -> CodecResult<i64> {
        if self.factor.is_zero() {
            return Err(CodecError::InvalidDefinition(format!(
                "signal {} has a zero factor",
                self.name
            )));
        }
        ((physical - self.offset) / self.factor)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .ok_or_else(|| CodecError::InvalidValue {
                signal: self.name.clone(),
                value: physical.to_string(),
            })
    }

    /// Enumeration label for a raw value, if any
    pub fn label(&self, raw: i64) -> Option<&str> {
        self.enumeration.get(&raw).map(String::as_str)
    }

    /// Human-readable value: enumeration label or scaled number with unit
    pub fn format_value(&self, raw: i64) -> String {
        if let Some(label) = self.label(raw) {
            return label.to_string();
        }
        let precision = precision_from_factor(self.factor);
        let physical = self.to_physical(raw).round_dp(precision);
        match &self.unit {
            Some(unit) if !unit.is_empty() => format!("{} {}", physical, unit),
            _ => physical.to_string(),
        }
    }

    /// Parse a user-entered value: enumeration label or physical number
    pub fn parse_value(&self, text: &str) -> CodecResult<i64> {
        let text = text.trim();
        if let Some((raw, _)) = self.enumeration.iter().find(|(_, label)| *label == text) {
            return Ok(*raw);
        }
        let physical = parse_decimal(text).ok_or_else(|| CodecError::InvalidValue {
            signal: self.name.clone(),
            value: text.to_string(),
        })?;
        self.to_raw(physical)
    }

    /// All tags: explicit ones plus `<tag>` markers in the comment
    pub fn all_tags(&self) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        if let Some(comment) = &self.comment {
            let mut rest = comment.as_str();
            while let Some(start) = rest.find('<') {
                let after = &rest[start + 1..];
                match after.find('>') {
                    Some(end) => {
                        let tag = after[..end].trim();
                        if !tag.is_empty() && !tag.contains(char::is_whitespace) {
                            tags.insert(tag.to_lowercase());
                        }
                        rest = &after[end + 1..];
                    }
                    None => break,
                }
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_little_endian_positions() {
        let sig = Signal::new("a", 4, 6);
        assert_eq!(sig.bit_positions(), vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(sig.required_bytes(), 2);
    }

    #[test]
    fn test_big_endian_positions() {
        // DBC start bit 7 is the MSB of byte 0; 12 bits run into byte 1
        let sig = Signal::new("b", 7, 12).big_endian();
        let positions = sig.bit_positions();
        assert_eq!(positions.last(), Some(&7)); // MSB
        assert_eq!(positions.first(), Some(&12)); // LSB sits in byte 1, bit 4
        assert_eq!(sig.required_bytes(), 2);
    }

    #[test]
    fn test_insert_extract_little_endian() {
        let sig = Signal::new("freq", 16, 16);
        let mut payload = [0u8; 8];
        sig.insert(0x0258, &mut payload).unwrap();
        assert_eq!(&payload[2..4], &[0x58, 0x02]);
        assert_eq!(sig.extract(&payload), Some(600));
    }

    #[test]
    fn test_insert_extract_big_endian() {
        let sig = Signal::new("word", 7, 16).big_endian();
        let mut payload = [0u8; 8];
        sig.insert(0x1234, &mut payload).unwrap();
        assert_eq!(&payload[0..2], &[0x12, 0x34]);
        assert_eq!(sig.extract(&payload), Some(0x1234));
    }

    #[test]
    fn test_signed_extraction() {
        let sig = Signal::new("temp", 0, 12).signed();
        let mut payload = [0u8; 8];
        sig.insert(-5, &mut payload).unwrap();
        assert_eq!(sig.extract(&payload), Some(-5));
    }

    #[test]
    fn test_width_overflow() {
        let sig = Signal::new("small", 0, 4);
        let mut payload = [0u8; 8];
        assert!(matches!(
            sig.insert(16, &mut payload),
            Err(CodecError::WidthOverflow { value: 16, .. })
        ));
        assert!(sig.insert(-1, &mut payload).is_err());

        let sig = Signal::new("s", 0, 4).signed();
        assert_eq!(sig.raw_bounds(), (-8, 7));
        assert!(sig.check_width(-8).is_ok());
        assert!(sig.check_width(8).is_err());
    }

    #[test]
    fn test_extract_short_payload() {
        let sig = Signal::new("late", 48, 16);
        assert_eq!(sig.extract(&[0u8; 6]), None);
    }

    #[test]
    fn test_insert_preserves_neighbours() {
        let sig = Signal::new("mid", 4, 4);
        let mut payload = [0xFFu8; 1];
        sig.insert(0, &mut payload).unwrap();
        assert_eq!(payload, [0x0F]);
    }

    #[test]
    fn test_physical_conversion() {
        let sig = Signal::new("freq", 0, 16).with_scaling("0.1", "0");
        assert_eq!(sig.to_physical(600), Decimal::from(60));
        assert_eq!(sig.to_raw(parse_decimal("60.04").unwrap()).unwrap(), 600);
        assert_eq!(sig.to_raw(parse_decimal("60.05").unwrap()).unwrap(), 601);
        assert_eq!(sig.format_value(600), "60.0");
    }

    #[test]
    fn test_enumeration() {
        let sig = Signal::new("mode", 0, 2).with_enum(&[(0, "Off"), (1, "On")]);
        assert_eq!(sig.format_value(1), "On");
        assert_eq!(sig.parse_value("Off").unwrap(), 0);
        assert_eq!(sig.parse_value("1").unwrap(), 1);
        assert!(sig.parse_value("Maybe").is_err());
    }

    #[test]
    fn test_comment_tags() {
        let sig = Signal::new("pw", 0, 32)
            .with_comment("Access password <secret> <write-only>")
            .with_tag("summary");
        let tags = sig.all_tags();
        assert!(tags.contains("secret"));
        assert!(tags.contains("write-only"));
        assert!(tags.contains("summary"));
        assert_eq!(tags.len(), 3);
    }
}
