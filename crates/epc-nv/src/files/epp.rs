//! `.epp` parameter files
//!
//! A flat JSON object mapping parameter names to the physical value (or the
//! enumeration label) of the value slot.

use std::path::Path;

use epc_conv::to_json_number;
use serde_json::{Map, Value};

use super::{raw_from_json, LoadReport};
use crate::error::NvResult;
use crate::meta::MetaEnum;
use crate::registry::Registry;

/// Known, non-secret values of the registry as an `.epp` object
pub fn to_map(registry: &Registry) -> Map<String, Value> {
    let mut map = Map::new();
    for param in registry.all_parameters() {
        if param.flags().secret {
            continue;
        }
        let Some(raw) = param.current_value() else {
            continue;
        };
        let value = match param.signal().label(raw) {
            Some(label) => Value::String(label.to_string()),
            None => to_json_number(param.signal().to_physical(raw)),
        };
        map.insert(param.name().to_string(), value);
    }
    map
}

/// Apply an `.epp` object to the value slots
///
/// Values are stored locally without range enforcement; the device decides
/// when they are written. Unknown and missing names are reported, not fatal.
pub fn apply_map(registry: &mut Registry, map: &Map<String, Value>) -> NvResult<LoadReport> {
    let mut report = LoadReport::default();
    for (name, value) in map {
        let Ok(id) = registry.lookup_name(name) else {
            report.unknown.push(name.clone());
            continue;
        };
        let applied = raw_from_json(registry.param(id)?.signal(), value)
            .and_then(|raw| registry.set_meta(id, MetaEnum::Value, raw, false));
        match applied {
            Ok(()) => report.applied += 1,
            Err(e) => {
                tracing::debug!(parameter = %name, error = %e, "Rejected .epp value");
                report.invalid.push(name.clone());
            }
        }
    }
    report.missing = registry
        .all_parameters()
        .iter()
        .filter(|p| !p.flags().secret && p.capabilities().writable)
        .filter(|p| !map.contains_key(p.name()))
        .map(|p| p.name().to_string())
        .collect();
    report.log("epp");
    Ok(report)
}

/// Load an `.epp` file into the registry
pub fn load_epp(path: impl AsRef<Path>, registry: &mut Registry) -> NvResult<LoadReport> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let map: Map<String, Value> = serde_json::from_str(&content)?;
    apply_map(registry, &map)
}

/// Save the registry's known value slots to an `.epp` file
pub fn save_epp(path: impl AsRef<Path>, registry: &Registry) -> NvResult<()> {
    let json = serde_json::to_string_pretty(&Value::Object(to_map(registry)))?;
    std::fs::write(path.as_ref(), json)?;
    tracing::info!(path = %path.as_ref().display(), "Saved .epp file");
    Ok(())
}
