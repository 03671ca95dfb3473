//! Error types for the frame codec

use thiserror::Error;

/// Errors that can occur while loading a CAN matrix or packing/unpacking frames
#[derive(Debug, Error)]
pub enum CodecError {
    /// Raw value does not fit the signal's storage width
    #[error("value {value} does not fit signal {signal} ({bits} bits, {signedness})")]
    WidthOverflow {
        signal: String,
        value: i64,
        bits: u16,
        signedness: &'static str,
    },

    /// Multiplexor value does not select any sub-frame
    #[error("unknown multiplex value {value} for frame {frame}")]
    UnknownMultiplex { frame: String, value: u64 },

    /// Multiplexed frame packed without a multiplexor value
    #[error("frame {0} is multiplexed but no multiplexor value was given")]
    MissingMultiplexor(String),

    /// Signal name not present in the selected layout
    #[error("unknown signal {signal} in frame {frame}")]
    UnknownSignal { frame: String, signal: String },

    /// Frame name or id not found in the matrix
    #[error("unknown frame: {0}")]
    UnknownFrame(String),

    /// Two non-multiplexor signals share payload bits
    #[error("signals {first} and {second} overlap in frame {frame}")]
    Overlap {
        frame: String,
        first: String,
        second: String,
    },

    /// Signal bits fall outside the frame payload
    #[error("signal {signal} does not fit the {length}-byte payload of frame {frame}")]
    OutsidePayload {
        frame: String,
        signal: String,
        length: u8,
    },

    /// Payload shorter than the layout requires
    #[error("payload too short: expected {expected} bytes, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },

    /// Definition is structurally invalid
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Physical value could not be parsed or converted
    #[error("invalid value for {signal}: {value}")]
    InvalidValue { signal: String, value: String },

    /// Invalid CAN identifier string
    #[error("invalid CAN id: {0}")]
    InvalidCanId(String),

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Parse a CAN identifier string (hex with `0x` prefix or decimal)
///
/// Accepts formats: "0x1FF00", "0X1ff00", "291"
pub fn parse_can_id(s: &str) -> CodecResult<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    match parsed {
        Ok(id) if id <= 0x1FFF_FFFF => Ok(id),
        _ => Err(CodecError::InvalidCanId(s.to_string())),
    }
}

/// Format a CAN identifier as hex string (uppercase, `0x` prefix)
pub fn format_can_id(id: u32, extended: bool) -> String {
    if extended {
        format!("0x{:08X}", id)
    } else {
        format!("0x{:03X}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x1FF00").unwrap(), 0x1FF00);
        assert_eq!(parse_can_id("0X1ff00").unwrap(), 0x1FF00);
        assert_eq!(parse_can_id("  291 ").unwrap(), 291);
        assert!(parse_can_id("0x20000000").is_err()); // beyond 29 bits
        assert!(parse_can_id("can").is_err());
    }

    #[test]
    fn test_format_can_id() {
        assert_eq!(format_can_id(0x123, false), "0x123");
        assert_eq!(format_can_id(0x1FF00, true), "0x0001FF00");
    }
}
