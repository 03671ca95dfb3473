//! NV parameter registry
//!
//! Parameters live in an arena and are addressed by [`ParamId`]. Groups form
//! a tree over the arena; every parameter is referenced exactly once, either
//! by the configured hierarchy or by the catch-all "unreferenced" group.
//!
//! The registry is built once from the set frame of the CAN matrix. After
//! that only slot contents change.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use epc_conv::{CanMatrix, Decimal, Frame, Signal};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::error::{ConfigError, NvError, NvResult};
use crate::meta::MetaEnum;

/// Signals with a fixed protocol role; never parameters
pub const ROLE_SIGNALS: [&str; 7] = [
    "MUX",
    "ReadParam_command",
    "ReadParam_status",
    "Meta",
    "SaveToEE_command",
    "SaveToEE_status",
    "SaveToEE",
];

/// Registry shared between the scheduler context and observers
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Handle of a parameter in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a group in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupId(usize);

/// One meta slot of a parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaSlot {
    /// Raw value, `None` when unknown
    pub value: Option<i64>,
    /// The cached value may not reflect the device
    pub stale: bool,
    /// Value last acknowledged by the device
    pub reset_value: Option<i64>,
}

impl Default for MetaSlot {
    fn default() -> Self {
        Self {
            value: None,
            stale: true,
            reset_value: None,
        }
    }
}

/// Behaviour flags derived from signal tags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParamFlags {
    pub read_only: bool,
    pub write_only: bool,
    pub secret: bool,
    pub is_factory: bool,
    pub is_summary: bool,
}

impl ParamFlags {
    fn from_signal(signal: &Signal) -> Self {
        let tags = signal.all_tags();
        let has = |names: &[&str]| names.iter().any(|n| tags.contains(*n));
        Self {
            read_only: has(&["read-only", "read_only", "readonly"]),
            write_only: has(&["write-only", "write_only", "writeonly"]),
            secret: has(&["secret"]),
            is_factory: has(&["factory"]),
            is_summary: has(&["summary"]),
        }
    }
}

/// Column capabilities of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
}

/// A persistent device setting exposed as a CAN signal
#[derive(Debug, Clone)]
pub struct Parameter {
    id: ParamId,
    mux_name: String,
    mux_id: u64,
    signal: Signal,
    slots: [MetaSlot; 5],
    scratch: Option<i64>,
    flags: ParamFlags,
}

impl Parameter {
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Signal name, unique across the registry
    pub fn name(&self) -> &str {
        &self.signal.name
    }

    pub fn mux_name(&self) -> &str {
        &self.mux_name
    }

    pub fn mux_id(&self) -> u64 {
        self.mux_id
    }

    /// `mux;signal`
    pub fn qualified_name(&self) -> String {
        format!("{};{}", self.mux_name, self.signal.name)
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn flags(&self) -> ParamFlags {
        self.flags
    }

    pub fn access_level(&self) -> u32 {
        self.signal.access_level.unwrap_or(0)
    }

    pub fn slot(&self, meta: MetaEnum) -> &MetaSlot {
        &self.slots[meta.index()]
    }

    /// Raw value of a slot
    pub fn get(&self, meta: MetaEnum) -> Option<i64> {
        self.slots[meta.index()].value
    }

    /// Raw value of the value slot
    pub fn current_value(&self) -> Option<i64> {
        self.get(MetaEnum::Value)
    }

    pub fn is_stale(&self, meta: MetaEnum) -> bool {
        self.slots[meta.index()].stale
    }

    pub fn scratch(&self) -> Option<i64> {
        self.scratch
    }

    /// Physical value of a slot
    pub fn physical(&self, meta: MetaEnum) -> Option<Decimal> {
        self.get(meta).map(|raw| self.signal.to_physical(raw))
    }

    /// Display text of a slot, empty when unknown
    pub fn format(&self, meta: MetaEnum) -> String {
        self.get(meta)
            .map(|raw| self.signal.format_value(raw))
            .unwrap_or_default()
    }

    /// Known lower and upper bound: slot values first, matrix limits second
    pub fn limits(&self) -> (Option<i64>, Option<i64>) {
        (
            self.get(MetaEnum::Minimum).or(self.signal.min),
            self.get(MetaEnum::Maximum).or(self.signal.max),
        )
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            readable: !self.flags.write_only,
            writable: !self.flags.read_only,
        }
    }
}

/// Entry of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupNode {
    Group(GroupId),
    Parameter(ParamId),
}

/// Organisational node of the parameter tree
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub parent: Option<GroupId>,
    pub children: Vec<GroupNode>,
}

/// Parameters sharing one sub-frame of the set frame
#[derive(Debug, Clone)]
pub struct MuxGroup {
    pub name: String,
    pub id: u64,
    pub params: Vec<ParamId>,
}

/// Change notification for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ValueChanged {
        param: ParamId,
        meta: MetaEnum,
        value: Option<i64>,
    },
    StaleChanged {
        param: ParamId,
        meta: MetaEnum,
        stale: bool,
    },
}

/// The parameter store
#[derive(Debug)]
pub struct Registry {
    params: Vec<Parameter>,
    by_path: HashMap<(String, String), ParamId>,
    by_name: HashMap<String, ParamId>,
    muxes: Vec<MuxGroup>,
    groups: Vec<Group>,
    root: GroupId,
    unreferenced: GroupId,
    access_level: Option<ParamId>,
    access_password: Option<ParamId>,
    events: Option<mpsc::Sender<RegistryEvent>>,
}

impl Registry {
    /// Build the registry from the set frame of `matrix`
    pub fn from_matrix(matrix: &CanMatrix, config: &DeviceConfig) -> NvResult<Self> {
        let set_name = config.variant.set_frame();
        let frame = matrix
            .find_frame(set_name)
            .ok_or_else(|| ConfigError::MissingFrame(set_name.to_string()))?;
        let mut registry = Self::from_frame(frame)?;

        registry.access_level = config
            .access_level_path
            .as_deref()
            .map(|p| registry.lookup_path(p))
            .transpose()?;
        registry.access_password = config
            .access_password_path
            .as_deref()
            .map(|p| registry.lookup_path(p))
            .transpose()?;

        if let Some(tree) = &config.hierarchy {
            registry.apply_hierarchy(tree)?;
        }
        Ok(registry)
    }

    /// Build a registry from the sub-frames of a multiplexed set frame
    ///
    /// Without a hierarchy, each sub-frame becomes a group under the root.
    pub fn from_frame(frame: &Frame) -> NvResult<Self> {
        if !frame.is_multiplexed() {
            return Err(ConfigError::Invalid(format!(
                "NV frame {} is not multiplexed",
                frame.name
            ))
            .into());
        }
        let mux_signal = frame.multiplexer.clone().unwrap_or_default();

        let mut registry = Self {
            params: Vec::new(),
            by_path: HashMap::new(),
            by_name: HashMap::new(),
            muxes: Vec::new(),
            groups: vec![Group {
                name: String::new(),
                parent: None,
                children: Vec::new(),
            }],
            root: GroupId(0),
            unreferenced: GroupId(0),
            access_level: None,
            access_password: None,
            events: None,
        };

        for sub in &frame.multiplexed {
            let mut mux = MuxGroup {
                name: sub.name.clone(),
                id: sub.id,
                params: Vec::new(),
            };
            let group = registry.add_group(&sub.name, registry.root);

            for signal in &sub.signals {
                if signal.name == mux_signal || ROLE_SIGNALS.contains(&signal.name.as_str()) {
                    continue;
                }
                if registry.by_name.contains_key(&signal.name) {
                    return Err(NvError::DuplicateName(signal.name.clone()));
                }
                let id = ParamId(registry.params.len());
                registry.params.push(Parameter {
                    id,
                    mux_name: sub.name.clone(),
                    mux_id: sub.id,
                    signal: signal.clone(),
                    slots: Default::default(),
                    scratch: None,
                    flags: ParamFlags::from_signal(signal),
                });
                registry.by_name.insert(signal.name.clone(), id);
                registry
                    .by_path
                    .insert((sub.name.clone(), signal.name.clone()), id);
                registry.groups[group.0].children.push(GroupNode::Parameter(id));
                mux.params.push(id);
            }
            registry.muxes.push(mux);
        }

        tracing::debug!(
            frame = %frame.name,
            parameters = registry.params.len(),
            muxes = registry.muxes.len(),
            "Built NV registry"
        );
        Ok(registry)
    }

    /// Wrap for sharing
    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Register the change-notification channel
    pub fn subscribe_events(&mut self, capacity: usize) -> mpsc::Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.events = Some(tx);
        rx
    }

    fn emit(&self, event: RegistryEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                tracing::warn!(error = %e, "Registry event dropped");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Parameter by `(multiplex_name, signal_name)`
    pub fn lookup(&self, mux_name: &str, signal_name: &str) -> NvResult<ParamId> {
        self.by_path
            .get(&(mux_name.to_string(), signal_name.to_string()))
            .copied()
            .ok_or_else(|| NvError::NotFound(format!("{};{}", mux_name, signal_name)))
    }

    /// Parameter by signal name
    pub fn lookup_name(&self, name: &str) -> NvResult<ParamId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| NvError::NotFound(name.to_string()))
    }

    /// Parameter by a `;`-separated path
    ///
    /// The last two segments are the multiplex and signal names; leading
    /// segments (typically the frame name) are ignored. A single segment is
    /// looked up by signal name.
    pub fn lookup_path(&self, path: &str) -> NvResult<ParamId> {
        let segments: Vec<&str> = path
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        match segments.as_slice() {
            [] => Err(NvError::NotFound(path.to_string())),
            [name] => self.lookup_name(name),
            [.., mux, signal] => self.lookup(mux, signal),
        }
    }

    pub fn param(&self, id: ParamId) -> NvResult<&Parameter> {
        self.params
            .get(id.0)
            .ok_or_else(|| NvError::NotFound(id.to_string()))
    }

    fn param_mut(&mut self, id: ParamId) -> NvResult<&mut Parameter> {
        self.params
            .get_mut(id.0)
            .ok_or_else(|| NvError::NotFound(id.to_string()))
    }

    /// All parameters in definition order
    pub fn all_parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Sub-frame groups in definition order
    pub fn muxes(&self) -> &[MuxGroup] {
        &self.muxes
    }

    /// Sub-frame group by multiplex id
    pub fn mux(&self, mux_id: u64) -> Option<&MuxGroup> {
        self.muxes.iter().find(|m| m.id == mux_id)
    }

    pub fn access_level_param(&self) -> Option<ParamId> {
        self.access_level
    }

    pub fn access_password_param(&self) -> Option<ParamId> {
        self.access_password
    }

    /// Partition parameters by multiplex id
    pub fn group_by_mux(&self, ids: &[ParamId]) -> NvResult<BTreeMap<u64, Vec<ParamId>>> {
        let mut groups: BTreeMap<u64, Vec<ParamId>> = BTreeMap::new();
        for &id in ids {
            let mux = self.param(id)?.mux_id;
            let entry = groups.entry(mux).or_default();
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
        Ok(groups)
    }

    // -------------------------------------------------------------------------
    // Slot policies
    // -------------------------------------------------------------------------

    /// Raw value of a slot
    pub fn get_meta(&self, id: ParamId, meta: MetaEnum) -> NvResult<Option<i64>> {
        Ok(self.param(id)?.get(meta))
    }

    /// Check `raw` against width and, with `check_range`, the known limits
    ///
    /// `minimum <= maximum` is always enforced for the limit slots.
    pub fn validate(&self, id: ParamId, meta: MetaEnum, raw: i64, check_range: bool) -> NvResult<()> {
        let param = self.param(id)?;
        let (min, max) = param.limits();
        self.validate_with_limits(id, meta, raw, check_range, min, max)
    }

    pub(crate) fn validate_with_limits(
        &self,
        id: ParamId,
        meta: MetaEnum,
        raw: i64,
        check_range: bool,
        min: Option<i64>,
        max: Option<i64>,
    ) -> NvResult<()> {
        let param = self.param(id)?;
        param.signal.check_width(raw)?;

        let out_of_range = || NvError::OutOfRange {
            name: param.name().to_string(),
            value: raw,
            min,
            max,
        };
        match meta {
            MetaEnum::Minimum => {
                let max = param.get(MetaEnum::Maximum);
                if max.is_some_and(|max| raw > max) {
                    return Err(NvError::OutOfRange {
                        name: param.name().to_string(),
                        value: raw,
                        min: None,
                        max,
                    });
                }
            }
            MetaEnum::Maximum => {
                let min = param.get(MetaEnum::Minimum);
                if min.is_some_and(|min| raw < min) {
                    return Err(NvError::OutOfRange {
                        name: param.name().to_string(),
                        value: raw,
                        min,
                        max: None,
                    });
                }
            }
            _ if check_range => {
                if min.is_some_and(|min| raw < min) || max.is_some_and(|max| raw > max) {
                    return Err(out_of_range());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Write a local slot; does not touch the bus
    pub fn set_meta(&mut self, id: ParamId, meta: MetaEnum, raw: i64, check_range: bool) -> NvResult<()> {
        self.validate(id, meta, raw, check_range)?;
        self.store(id, meta, Some(raw))
    }

    fn store(&mut self, id: ParamId, meta: MetaEnum, value: Option<i64>) -> NvResult<()> {
        let slot = &mut self.param_mut(id)?.slots[meta.index()];
        if slot.value != value {
            slot.value = value;
            self.emit(RegistryEvent::ValueChanged {
                param: id,
                meta,
                value,
            });
        }
        Ok(())
    }

    fn set_stale(&mut self, id: ParamId, meta: MetaEnum, stale: bool) -> NvResult<()> {
        let slot = &mut self.param_mut(id)?.slots[meta.index()];
        if slot.stale != stale {
            slot.stale = stale;
            self.emit(RegistryEvent::StaleChanged {
                param: id,
                meta,
                stale,
            });
        }
        Ok(())
    }

    /// Record a value the device reported
    ///
    /// Clears the stale flag and remembers the value as the reset target.
    pub fn apply_device_value(&mut self, id: ParamId, meta: MetaEnum, raw: i64) -> NvResult<()> {
        self.store(id, meta, Some(raw))?;
        self.param_mut(id)?.slots[meta.index()].reset_value = Some(raw);
        self.set_stale(id, meta, false)
    }

    /// Set a slot to unknown
    pub fn clear(&mut self, id: ParamId, meta: MetaEnum) -> NvResult<()> {
        self.store(id, meta, None)
    }

    /// Restore the last device-acknowledged value
    pub fn reset(&mut self, id: ParamId, meta: MetaEnum) -> NvResult<Option<i64>> {
        let value = self.param(id)?.slot(meta).reset_value;
        self.store(id, meta, value)?;
        Ok(value)
    }

    /// Clamp a slot into the limits range checks use
    ///
    /// Cached minimum/maximum slots win over the matrix limits. An inverted
    /// range leaves the value alone.
    pub fn saturate(&mut self, id: ParamId, meta: MetaEnum) -> NvResult<Option<i64>> {
        let param = self.param(id)?;
        let (min, max) = param.limits();
        let clamped = match (param.get(meta), min, max) {
            (Some(_), Some(min), Some(max)) if min > max => param.get(meta),
            (value, min, max) => value.map(|v| {
                let v = min.map_or(v, |min| v.max(min));
                max.map_or(v, |max| v.min(max))
            }),
        };
        self.store(id, meta, clamped)?;
        Ok(clamped)
    }

    /// Mark one slot stale
    pub fn mark_stale(&mut self, id: ParamId, meta: MetaEnum) -> NvResult<()> {
        self.set_stale(id, meta, true)
    }

    /// Mark every parameter's value slot stale
    pub fn mark_all_stale(&mut self) {
        for index in 0..self.params.len() {
            let _ = self.set_stale(ParamId(index), MetaEnum::Value, true);
        }
    }

    /// Local editing buffer, never sent to the device
    pub fn set_scratch(&mut self, id: ParamId, raw: Option<i64>) -> NvResult<()> {
        if let Some(raw) = raw {
            self.param(id)?.signal.check_width(raw)?;
        }
        self.param_mut(id)?.scratch = raw;
        Ok(())
    }

    /// Whether a caller at `level` may write `id`
    pub fn can_write(&self, id: ParamId, level: u32) -> NvResult<bool> {
        let param = self.param(id)?;
        Ok(!param.flags.read_only && param.access_level() <= level)
    }

    /// Apply `{name: physical}` defaults to the value slot, leaving it stale
    pub fn apply_defaults(&mut self, defaults: &serde_json::Map<String, serde_json::Value>) -> NvResult<usize> {
        let mut applied = 0;
        for (name, value) in defaults {
            let Ok(id) = self.lookup_name(name) else {
                tracing::warn!(parameter = %name, "Default for unknown parameter ignored");
                continue;
            };
            let raw = crate::files::raw_from_json(&self.param(id)?.signal, value)?;
            self.set_meta(id, MetaEnum::Value, raw, false)?;
            applied += 1;
        }
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Group tree
    // -------------------------------------------------------------------------

    pub fn root(&self) -> GroupId {
        self.root
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id.0)
    }

    /// The catch-all group, equal to the root until a hierarchy is applied
    pub fn unreferenced(&self) -> GroupId {
        self.unreferenced
    }

    fn add_group(&mut self, name: &str, parent: GroupId) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(Group {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.groups[parent.0].children.push(GroupNode::Group(id));
        id
    }

    /// Replace the default tree with a configured hierarchy
    ///
    /// A node is either a `[mux, signal]` leaf or `{"name": .., "children": [..]}`.
    /// Parameters the tree does not mention land in an "unreferenced" group.
    pub fn apply_hierarchy(&mut self, tree: &serde_json::Value) -> NvResult<()> {
        self.groups.truncate(1);
        self.groups[0].children.clear();
        if let Some(name) = tree.get("name").and_then(|n| n.as_str()) {
            self.groups[0].name = name.to_string();
        }

        let mut seen = vec![false; self.params.len()];
        let children = tree
            .get("children")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        for child in &children {
            self.add_node(child, self.root, &mut seen)?;
        }

        let unreferenced = self.add_group("Unreferenced", self.root);
        self.unreferenced = unreferenced;
        for (index, referenced) in seen.into_iter().enumerate() {
            if !referenced {
                self.groups[unreferenced.0]
                    .children
                    .push(GroupNode::Parameter(ParamId(index)));
            }
        }
        Ok(())
    }

    fn add_node(&mut self, node: &serde_json::Value, parent: GroupId, seen: &mut [bool]) -> NvResult<()> {
        match node {
            serde_json::Value::Array(path) => {
                let parts: Vec<&str> = path.iter().filter_map(|p| p.as_str()).collect();
                let id = match parts.as_slice() {
                    [mux, signal] => self.lookup(mux, signal)?,
                    [name] => self.lookup_name(name)?,
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "hierarchy leaf must be [mux, signal], got {}",
                            node
                        ))
                        .into())
                    }
                };
                if std::mem::replace(&mut seen[id.0], true) {
                    return Err(NvError::DuplicateName(self.params[id.0].qualified_name()));
                }
                self.groups[parent.0].children.push(GroupNode::Parameter(id));
            }
            serde_json::Value::Object(map) => {
                let name = map.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                let group = self.add_group(name, parent);
                if let Some(children) = map.get("children").and_then(|c| c.as_array()) {
                    for child in children {
                        self.add_node(child, group, seen)?;
                    }
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!("invalid hierarchy node {}", other)).into())
            }
        }
        Ok(())
    }

    /// Parameters below `group`, depth first in tree order
    pub fn leaves(&self, group: GroupId) -> Vec<ParamId> {
        let mut out = Vec::new();
        let mut stack = vec![GroupNode::Group(group)];
        while let Some(node) = stack.pop() {
            match node {
                GroupNode::Parameter(id) => out.push(id),
                GroupNode::Group(g) => {
                    if let Some(group) = self.groups.get(g.0) {
                        // reversed so children pop in tree order
                        stack.extend(group.children.iter().rev().copied());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use epc_conv::SubFrame;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(crate) fn set_frame() -> Frame {
        Frame::new("ParameterQuery", 0x1FF00, true)
            .with_multiplexer(Signal::new("MUX", 0, 8))
            .with_signal(Signal::new("ReadParam_command", 8, 1))
            .with_signal(Signal::new("Meta", 9, 3))
            .with_sub_frame(SubFrame::new(
                3,
                "Frequency",
                vec![
                    Signal::new("FrequencyReference", 16, 16).with_scaling("0.1", "0"),
                    Signal::new("FrequencyLimit", 32, 16),
                ],
            ))
            .with_sub_frame(SubFrame::new(
                4,
                "Access",
                vec![
                    Signal::new("AccessLevel", 16, 8),
                    Signal::new("AccessPassword", 24, 32).with_comment("<secret> <write-only>"),
                    Signal::new("SerialNumber", 56, 8).with_comment("<read-only> <factory>"),
                ],
            ))
    }

    fn registry() -> Registry {
        Registry::from_frame(&set_frame()).unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let reg = registry();
        assert_eq!(reg.len(), 5);
        let id = reg.lookup("Frequency", "FrequencyReference").unwrap();
        assert_eq!(reg.param(id).unwrap().mux_id(), 3);
        assert_eq!(reg.lookup_path("ParameterQuery;Access;AccessLevel").unwrap(), reg.lookup_name("AccessLevel").unwrap());
        assert!(matches!(
            reg.lookup("Frequency", "Nope"),
            Err(NvError::NotFound(_))
        ));
        // Role signals are not parameters
        assert!(reg.lookup_name("MUX").is_err());
        assert!(reg.lookup_name("Meta").is_err());
    }

    #[test]
    fn test_flags_from_tags() {
        let reg = registry();
        let pw = reg.param(reg.lookup_name("AccessPassword").unwrap()).unwrap();
        assert!(pw.flags().secret && pw.flags().write_only);
        assert!(!pw.capabilities().readable);
        let sn = reg.param(reg.lookup_name("SerialNumber").unwrap()).unwrap();
        assert!(sn.flags().read_only && sn.flags().is_factory);
        assert!(!reg.can_write(sn.id(), 10).unwrap());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let frame = set_frame().with_sub_frame(SubFrame::new(
            5,
            "Again",
            vec![Signal::new("FrequencyReference", 16, 16)],
        ));
        assert!(matches!(
            Registry::from_frame(&frame),
            Err(NvError::DuplicateName(name)) if name == "FrequencyReference"
        ));
    }

    #[test]
    fn test_set_get_and_range() {
        let mut reg = registry();
        let id = reg.lookup_name("FrequencyLimit").unwrap();
        reg.set_meta(id, MetaEnum::Minimum, 100, true).unwrap();
        reg.set_meta(id, MetaEnum::Maximum, 500, true).unwrap();

        for raw in [100, 500] {
            reg.set_meta(id, MetaEnum::Value, raw, true).unwrap();
            assert_eq!(reg.get_meta(id, MetaEnum::Value).unwrap(), Some(raw));
        }
        for raw in [99, 501] {
            assert!(matches!(
                reg.set_meta(id, MetaEnum::Value, raw, true),
                Err(NvError::OutOfRange { .. })
            ));
            reg.set_meta(id, MetaEnum::Value, raw, false).unwrap();
        }
    }

    #[test]
    fn test_min_never_exceeds_max() {
        let mut reg = registry();
        let id = reg.lookup_name("FrequencyLimit").unwrap();
        reg.set_meta(id, MetaEnum::Maximum, 500, false).unwrap();
        assert!(reg.set_meta(id, MetaEnum::Minimum, 501, false).is_err());
        reg.set_meta(id, MetaEnum::Minimum, 500, false).unwrap();
        assert!(reg.set_meta(id, MetaEnum::Maximum, 499, false).is_err());
    }

    #[test]
    fn test_width_overflow() {
        let mut reg = registry();
        let id = reg.lookup_name("AccessLevel").unwrap();
        assert!(matches!(
            reg.set_meta(id, MetaEnum::Value, 256, false),
            Err(NvError::WidthOverflow { value: 256, .. })
        ));
        assert!(reg.set_scratch(id, Some(-1)).is_err());
        reg.set_scratch(id, Some(3)).unwrap();
        assert_eq!(reg.param(id).unwrap().scratch(), Some(3));
    }

    #[test]
    fn test_clear_reset_saturate() {
        let mut reg = registry();
        let id = reg.lookup_name("FrequencyLimit").unwrap();
        reg.apply_device_value(id, MetaEnum::Value, 300).unwrap();
        assert!(!reg.param(id).unwrap().is_stale(MetaEnum::Value));

        reg.set_meta(id, MetaEnum::Value, 700, false).unwrap();
        assert_eq!(reg.reset(id, MetaEnum::Value).unwrap(), Some(300));

        reg.clear(id, MetaEnum::Value).unwrap();
        assert_eq!(reg.get_meta(id, MetaEnum::Value).unwrap(), None);

        reg.set_meta(id, MetaEnum::Minimum, 100, false).unwrap();
        reg.set_meta(id, MetaEnum::Maximum, 500, false).unwrap();
        reg.set_meta(id, MetaEnum::Value, 900, false).unwrap();
        assert_eq!(reg.saturate(id, MetaEnum::Value).unwrap(), Some(500));
        reg.set_meta(id, MetaEnum::Value, 5, false).unwrap();
        assert_eq!(reg.saturate(id, MetaEnum::Value).unwrap(), Some(100));
    }

    #[test]
    fn test_saturate_falls_back_to_matrix_limits() {
        let frame = Frame::new("ParameterQuery", 0x1FF00, true)
            .with_multiplexer(Signal::new("MUX", 0, 8))
            .with_sub_frame(SubFrame::new(
                3,
                "Frequency",
                vec![Signal::new("FrequencyLimit", 16, 16).with_limits(50, 400)],
            ));
        let mut reg = Registry::from_frame(&frame).unwrap();
        let id = reg.lookup_name("FrequencyLimit").unwrap();

        reg.set_meta(id, MetaEnum::Value, 900, false).unwrap();
        assert!(reg.validate(id, MetaEnum::Value, 900, true).is_err());
        assert_eq!(reg.saturate(id, MetaEnum::Value).unwrap(), Some(400));
        reg.validate(id, MetaEnum::Value, 400, true).unwrap();

        // A cached minimum overrides the matrix one, the matrix maximum still applies
        reg.set_meta(id, MetaEnum::Minimum, 120, false).unwrap();
        reg.set_meta(id, MetaEnum::Value, 10, false).unwrap();
        assert_eq!(reg.saturate(id, MetaEnum::Value).unwrap(), Some(120));
        reg.set_meta(id, MetaEnum::Value, 1000, false).unwrap();
        assert_eq!(reg.saturate(id, MetaEnum::Value).unwrap(), Some(400));
    }

    #[test]
    fn test_mark_all_stale_and_events() {
        let mut reg = registry();
        let mut events = reg.subscribe_events(16);
        let id = reg.lookup_name("FrequencyReference").unwrap();

        reg.apply_device_value(id, MetaEnum::Value, 600).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ValueChanged {
                param: id,
                meta: MetaEnum::Value,
                value: Some(600)
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::StaleChanged {
                param: id,
                meta: MetaEnum::Value,
                stale: false
            }
        );

        reg.mark_all_stale();
        assert!(reg.param(id).unwrap().is_stale(MetaEnum::Value));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::StaleChanged {
                param: id,
                meta: MetaEnum::Value,
                stale: true
            }
        );
    }

    #[test]
    fn test_event_overflow_does_not_block() {
        let mut reg = registry();
        let _events = reg.subscribe_events(1);
        let id = reg.lookup_name("FrequencyLimit").unwrap();
        for raw in 0..10 {
            reg.set_meta(id, MetaEnum::Value, raw, false).unwrap();
        }
        assert_eq!(reg.get_meta(id, MetaEnum::Value).unwrap(), Some(9));
    }

    #[test]
    fn test_default_tree_groups_by_mux() {
        let reg = registry();
        let root = reg.group(reg.root()).unwrap();
        assert_eq!(root.children.len(), 2);
        let names: Vec<String> = reg
            .leaves(reg.root())
            .into_iter()
            .map(|id| reg.param(id).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "FrequencyReference",
                "FrequencyLimit",
                "AccessLevel",
                "AccessPassword",
                "SerialNumber"
            ]
        );
    }

    #[test]
    fn test_hierarchy() {
        let mut reg = registry();
        reg.apply_hierarchy(&json!({
            "name": "Inverter",
            "children": [
                {"name": "Drive", "children": [["Frequency", "FrequencyLimit"], ["Frequency", "FrequencyReference"]]},
                ["AccessLevel"]
            ]
        }))
        .unwrap();

        let names: Vec<String> = reg
            .leaves(reg.root())
            .into_iter()
            .map(|id| reg.param(id).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "FrequencyLimit",
                "FrequencyReference",
                "AccessLevel",
                "AccessPassword",
                "SerialNumber"
            ]
        );
        let unreferenced = reg.leaves(reg.unreferenced());
        assert_eq!(unreferenced.len(), 2);
    }

    #[test]
    fn test_hierarchy_rejects_double_reference() {
        let mut reg = registry();
        let err = reg
            .apply_hierarchy(&json!({"children": [["AccessLevel"], ["Access", "AccessLevel"]]}))
            .unwrap_err();
        assert!(matches!(err, NvError::DuplicateName(_)));
    }

    #[test]
    fn test_group_by_mux() {
        let reg = registry();
        let ids = vec![
            reg.lookup_name("AccessLevel").unwrap(),
            reg.lookup_name("FrequencyReference").unwrap(),
            reg.lookup_name("FrequencyLimit").unwrap(),
        ];
        let groups = reg.group_by_mux(&ids).unwrap();
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(groups[&3].len(), 2);
    }

    #[test]
    fn test_apply_defaults_leaves_stale() {
        let mut reg = registry();
        let defaults = json!({"FrequencyReference": 50.5, "Unknown": 1});
        let applied = reg.apply_defaults(defaults.as_object().unwrap()).unwrap();
        assert_eq!(applied, 1);
        let id = reg.lookup_name("FrequencyReference").unwrap();
        assert_eq!(reg.get_meta(id, MetaEnum::Value).unwrap(), Some(505));
        assert!(reg.param(id).unwrap().is_stale(MetaEnum::Value));
    }
}
