//! Core types for the frame codec

use serde::{Deserialize, Serialize};

/// Bit numbering of a signal within the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel: start bit is the LSB, bits advance towards higher payload bits
    #[default]
    #[serde(alias = "intel")]
    Little,
    /// Motorola: start bit is the MSB, DBC sawtooth numbering
    #[serde(alias = "motorola")]
    Big,
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteOrder::Little => f.write_str("little"),
            ByteOrder::Big => f.write_str("big"),
        }
    }
}

/// A single CAN frame as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanFrame {
    /// 11-bit or 29-bit identifier
    pub id: u32,
    /// Whether `id` is a 29-bit identifier
    pub extended: bool,
    /// Payload, 0..=8 bytes
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, extended: bool, data: Vec<u8>) -> Self {
        Self { id, extended, data }
    }

    /// Whether this frame carries the given identifier
    pub fn matches(&self, id: u32, extended: bool) -> bool {
        self.id == id && self.extended == extended
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]",
            crate::error::format_can_id(self.id, self.extended),
            self.data
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_aliases() {
        let order: ByteOrder = serde_yaml::from_str("intel").unwrap();
        assert_eq!(order, ByteOrder::Little);
        let order: ByteOrder = serde_yaml::from_str("motorola").unwrap();
        assert_eq!(order, ByteOrder::Big);
    }

    #[test]
    fn test_frame_display() {
        let frame = CanFrame::new(0x1FF00, true, vec![0x03, 0x01, 0x58, 0x02]);
        assert_eq!(frame.to_string(), "0x0001FF00 [03 01 58 02]");
    }
}
