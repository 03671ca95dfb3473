//! Parameter file codecs
//!
//! - `.epp`: flat JSON object `{name: value}` for the value slot
//! - `.pmvs`: value set with every meta slot and the column capabilities
//!
//! Both codecs work on the local registry only; pushing the loaded values
//! to the device is a transaction.

pub mod epp;
pub mod pmvs;

pub use epp::{load_epp, save_epp};
pub use pmvs::{ValueSet, ValueSetEntry};

use epc_conv::{decimal_from_json, Signal};
use serde::Serialize;

use crate::error::{NvError, NvResult};

/// Outcome of applying a parameter file to a registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Slots written
    pub applied: usize,
    /// Names in the file that the registry does not know
    pub unknown: Vec<String>,
    /// Registry parameters the file does not mention
    pub missing: Vec<String>,
    /// Names whose value could not be converted
    pub invalid: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty() && self.missing.is_empty() && self.invalid.is_empty()
    }

    fn log(&self, kind: &str) {
        for name in &self.unknown {
            tracing::warn!(file = kind, parameter = %name, "Unknown parameter in file");
        }
        for name in &self.missing {
            tracing::warn!(file = kind, parameter = %name, "Parameter missing from file");
        }
        for name in &self.invalid {
            tracing::warn!(file = kind, parameter = %name, "Invalid value in file");
        }
        tracing::info!(
            file = kind,
            applied = self.applied,
            unknown = self.unknown.len(),
            missing = self.missing.len(),
            invalid = self.invalid.len(),
            "Parameter file applied"
        );
    }
}

/// Convert a JSON scalar to a raw value of `signal`
///
/// Strings are tried as enumeration labels first, then as numbers; numbers
/// are physical values.
pub(crate) fn raw_from_json(signal: &Signal, value: &serde_json::Value) -> NvResult<i64> {
    let invalid = || NvError::InvalidValue {
        name: signal.name.clone(),
        value: value.to_string(),
    };
    match value {
        serde_json::Value::String(text) => Ok(signal.parse_value(text)?),
        serde_json::Value::Number(_) | serde_json::Value::Bool(_) => {
            let physical = decimal_from_json(value).ok_or_else(invalid)?;
            Ok(signal.to_raw(physical)?)
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_from_json() {
        let signal = Signal::new("Mode", 0, 8)
            .with_scaling("0.5", "0")
            .with_enum(&[(0, "Off"), (2, "On")]);
        assert_eq!(raw_from_json(&signal, &json!(1.5)).unwrap(), 3);
        assert_eq!(raw_from_json(&signal, &json!("On")).unwrap(), 2);
        assert_eq!(raw_from_json(&signal, &json!("2.0")).unwrap(), 4);
        assert!(raw_from_json(&signal, &json!(null)).is_err());
        assert!(raw_from_json(&signal, &json!("Sideways")).is_err());
    }
}
