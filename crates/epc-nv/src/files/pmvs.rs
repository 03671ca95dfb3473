//! `.pmvs` value sets
//!
//! One record per parameter holding every meta slot as a physical value.
//! Absent or `null` fields are unknown, never zero.

use std::path::Path;

use epc_conv::Decimal;
use serde::{Deserialize, Serialize};

use super::LoadReport;
use crate::error::NvResult;
use crate::meta::MetaEnum;
use crate::registry::{ParamId, Registry};

/// One parameter of a value set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSetEntry {
    pub name: String,
    #[serde(default, with = "opt_decimal")]
    pub value: Option<Decimal>,
    #[serde(default, with = "opt_decimal")]
    pub user_default: Option<Decimal>,
    #[serde(default, with = "opt_decimal")]
    pub factory_default: Option<Decimal>,
    #[serde(default, with = "opt_decimal")]
    pub minimum: Option<Decimal>,
    #[serde(default, with = "opt_decimal")]
    pub maximum: Option<Decimal>,
    #[serde(default)]
    pub readable: Option<bool>,
    #[serde(default)]
    pub writable: Option<bool>,
}

impl ValueSetEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn slot(&self, meta: MetaEnum) -> Option<Decimal> {
        match meta {
            MetaEnum::Value => self.value,
            MetaEnum::UserDefault => self.user_default,
            MetaEnum::FactoryDefault => self.factory_default,
            MetaEnum::Minimum => self.minimum,
            MetaEnum::Maximum => self.maximum,
        }
    }

    pub fn slot_mut(&mut self, meta: MetaEnum) -> &mut Option<Decimal> {
        match meta {
            MetaEnum::Value => &mut self.value,
            MetaEnum::UserDefault => &mut self.user_default,
            MetaEnum::FactoryDefault => &mut self.factory_default,
            MetaEnum::Minimum => &mut self.minimum,
            MetaEnum::Maximum => &mut self.maximum,
        }
    }

    /// Field-wise merge: every known field of `other` wins
    pub fn overlay(&mut self, other: &ValueSetEntry) {
        for meta in MetaEnum::ALL {
            if let Some(value) = other.slot(meta) {
                *self.slot_mut(meta) = Some(value);
            }
        }
        if other.readable.is_some() {
            self.readable = other.readable;
        }
        if other.writable.is_some() {
            self.writable = other.writable;
        }
    }
}

/// A set of parameter records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSet {
    #[serde(default)]
    pub parameters: Vec<ValueSetEntry>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every non-secret parameter
    pub fn from_registry(registry: &Registry) -> Self {
        let parameters = registry
            .all_parameters()
            .iter()
            .filter(|p| !p.flags().secret)
            .map(|p| {
                let mut entry = ValueSetEntry::new(p.name());
                for meta in MetaEnum::ALL {
                    *entry.slot_mut(meta) = p.physical(meta);
                }
                let caps = p.capabilities();
                entry.readable = Some(caps.readable);
                entry.writable = Some(caps.writable);
                entry
            })
            .collect();
        Self { parameters }
    }

    pub fn get(&self, name: &str) -> Option<&ValueSetEntry> {
        self.parameters.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Merge `other` into this set
    ///
    /// Known fields of `other` win; entries only `other` has are appended.
    pub fn overlay(&mut self, other: &ValueSet) {
        for entry in &other.parameters {
            match self.parameters.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => existing.overlay(entry),
                None => self.parameters.push(entry.clone()),
            }
        }
    }

    /// Write the known slots into the registry
    ///
    /// Slots are stored locally without range enforcement. Limits go first,
    /// and an entry carrying both bounds replaces them together so moving
    /// the range never trips the `minimum <= maximum` check halfway.
    pub fn apply_to(&self, registry: &mut Registry) -> NvResult<LoadReport> {
        let mut report = LoadReport::default();
        for entry in &self.parameters {
            let Ok(id) = registry.lookup_name(&entry.name) else {
                report.unknown.push(entry.name.clone());
                continue;
            };
            match apply_entry(registry, id, entry) {
                Ok(applied) => report.applied += applied,
                Err(e) => {
                    tracing::debug!(parameter = %entry.name, error = %e, "Rejected value set entry");
                    report.invalid.push(entry.name.clone());
                }
            }
        }
        report.missing = registry
            .all_parameters()
            .iter()
            .filter(|p| !p.flags().secret && self.get(p.name()).is_none())
            .map(|p| p.name().to_string())
            .collect();
        report.log("pmvs");
        Ok(report)
    }

    pub fn from_json(json: &str) -> NvResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> NvResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> NvResult<Self> {
        Self::from_json(&std::fs::read_to_string(path.as_ref())?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> NvResult<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        tracing::info!(path = %path.as_ref().display(), parameters = self.len(), "Saved value set");
        Ok(())
    }
}

fn apply_entry(registry: &mut Registry, id: ParamId, entry: &ValueSetEntry) -> NvResult<usize> {
    let signal = registry.param(id)?.signal().clone();
    let mut raws = Vec::new();
    for meta in MetaEnum::ALL {
        if let Some(physical) = entry.slot(meta) {
            raws.push((meta, signal.to_raw(physical)?));
        }
    }

    let limits = raws.iter().filter(|(m, _)| !m.is_ranged()).count();
    if limits == 2 {
        registry.clear(id, MetaEnum::Minimum)?;
        registry.clear(id, MetaEnum::Maximum)?;
    }
    raws.sort_by_key(|(meta, _)| meta.is_ranged());
    for (meta, raw) in &raws {
        registry.set_meta(id, *meta, *raw, false)?;
    }
    Ok(raws.len())
}

/// `Option<Decimal>` as a JSON number or `null`
mod opt_decimal {
    use epc_conv::{decimal_from_json, to_json_number, Decimal};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Decimal>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(to_json_number).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => decimal_from_json(&value)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {}", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::set_frame;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::from_frame(&set_frame()).unwrap()
    }

    #[test]
    fn test_missing_fields_are_unknown() {
        let set = ValueSet::from_json(
            r#"{"parameters": [{"name": "FrequencyLimit", "value": 250, "maximum": null}]}"#,
        )
        .unwrap();
        let entry = set.get("FrequencyLimit").unwrap();
        assert_eq!(entry.value, Some(Decimal::from(250)));
        assert_eq!(entry.maximum, None);
        assert_eq!(entry.minimum, None);
        assert_eq!(entry.readable, None);
    }

    #[test]
    fn test_round_trip_through_file() {
        let mut original = registry();
        let freq = original.lookup_name("FrequencyReference").unwrap();
        let limit = original.lookup_name("FrequencyLimit").unwrap();
        let pw = original.lookup_name("AccessPassword").unwrap();
        original.set_meta(freq, MetaEnum::Value, 605, false).unwrap();
        original.set_meta(freq, MetaEnum::Minimum, 10, false).unwrap();
        original.set_meta(freq, MetaEnum::Maximum, 900, false).unwrap();
        original.set_meta(limit, MetaEnum::FactoryDefault, 42, false).unwrap();
        original.set_meta(pw, MetaEnum::Value, 1234, false).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.pmvs");
        ValueSet::from_registry(&original).save(&path).unwrap();

        let mut restored = registry();
        let report = ValueSet::load(&path).unwrap().apply_to(&mut restored).unwrap();
        assert!(report.is_clean());

        for param in original.all_parameters() {
            if param.flags().secret {
                continue;
            }
            for meta in MetaEnum::ALL {
                assert_eq!(
                    restored.get_meta(param.id(), meta).unwrap(),
                    param.get(meta),
                    "{} {}",
                    param.name(),
                    meta
                );
            }
        }
        assert_eq!(restored.get_meta(pw, MetaEnum::Value).unwrap(), None);
    }

    #[test]
    fn test_apply_moves_both_limits() {
        let mut reg = registry();
        let id = reg.lookup_name("FrequencyLimit").unwrap();
        reg.set_meta(id, MetaEnum::Minimum, 10, false).unwrap();
        reg.set_meta(id, MetaEnum::Maximum, 20, false).unwrap();

        let mut entry = ValueSetEntry::new("FrequencyLimit");
        entry.minimum = Some(Decimal::from(100));
        entry.maximum = Some(Decimal::from(200));
        let set = ValueSet {
            parameters: vec![entry],
        };
        set.apply_to(&mut reg).unwrap();
        assert_eq!(reg.get_meta(id, MetaEnum::Minimum).unwrap(), Some(100));
        assert_eq!(reg.get_meta(id, MetaEnum::Maximum).unwrap(), Some(200));
    }

    #[test]
    fn test_overlay_later_non_null_wins() {
        let mut base = ValueSet::from_json(
            r#"{"parameters": [
                {"name": "A", "value": 1, "minimum": 0, "maximum": 10},
                {"name": "B", "value": 2}
            ]}"#,
        )
        .unwrap();
        let first = ValueSet::from_json(r#"{"parameters": [{"name": "A", "value": 5, "maximum": null}]}"#).unwrap();
        let second = ValueSet::from_json(
            r#"{"parameters": [{"name": "A", "maximum": 8}, {"name": "C", "value": 3}]}"#,
        )
        .unwrap();
        base.overlay(&first);
        base.overlay(&second);

        let a = base.get("A").unwrap();
        assert_eq!(a.value, Some(Decimal::from(5)));
        assert_eq!(a.minimum, Some(Decimal::from(0)));
        assert_eq!(a.maximum, Some(Decimal::from(8)));
        assert_eq!(base.get("B").unwrap().value, Some(Decimal::from(2)));
        assert_eq!(base.get("C").unwrap().value, Some(Decimal::from(3)));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_scaled_values_serialize_cleanly() {
        let mut reg = registry();
        let id = reg.lookup_name("FrequencyReference").unwrap();
        reg.set_meta(id, MetaEnum::Value, 600, false).unwrap();
        let json = ValueSet::from_registry(&reg).to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["parameters"][0]["value"], serde_json::json!(60));
        assert_eq!(parsed["parameters"][0]["minimum"], serde_json::Value::Null);
    }
}
