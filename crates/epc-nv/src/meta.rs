//! Meta selector

use serde::{Deserialize, Serialize};

/// One of the five slots every parameter carries
///
/// The discriminant is the tag sent in the `Meta` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaEnum {
    Value = 0,
    UserDefault = 1,
    FactoryDefault = 2,
    Minimum = 3,
    Maximum = 4,
}

impl MetaEnum {
    /// All metas in tag order
    pub const ALL: [MetaEnum; 5] = [
        MetaEnum::Value,
        MetaEnum::UserDefault,
        MetaEnum::FactoryDefault,
        MetaEnum::Minimum,
        MetaEnum::Maximum,
    ];

    /// Order in which the cyclic reader refreshes metas; limits come first
    pub const READ_ORDER: [MetaEnum; 5] = [
        MetaEnum::Minimum,
        MetaEnum::Maximum,
        MetaEnum::UserDefault,
        MetaEnum::FactoryDefault,
        MetaEnum::Value,
    ];

    /// Order in which a commit writes meta groups; limits land before values
    pub const WRITE_ORDER: [MetaEnum; 5] = [
        MetaEnum::Maximum,
        MetaEnum::Minimum,
        MetaEnum::FactoryDefault,
        MetaEnum::UserDefault,
        MetaEnum::Value,
    ];

    /// Wire tag
    pub fn tag(self) -> i64 {
        self as i64
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.tag() == tag)
    }

    /// Slot index
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetaEnum::Value => "value",
            MetaEnum::UserDefault => "user_default",
            MetaEnum::FactoryDefault => "factory_default",
            MetaEnum::Minimum => "minimum",
            MetaEnum::Maximum => "maximum",
        }
    }

    /// Whether this slot is checked against the `[minimum, maximum]` window
    pub fn is_ranged(self) -> bool {
        !matches!(self, MetaEnum::Minimum | MetaEnum::Maximum)
    }
}

impl std::fmt::Display for MetaEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
