//! Simulator configuration
//!
//! A TOML file naming the device manifest, the bus and the initial device
//! state:
//!
//! ```toml
//! manifest = "inverter.json"
//!
//! [bus]
//! type = "socket_can"
//! interface = "vcan0"
//!
//! [ccp]
//! command_id = "0x700"
//! response_id = "0x701"
//!
//! [[memory]]
//! address = "0x1000"
//! hex = "785634120a000000"
//!
//! [[values]]
//! name = "FrequencyReference"
//! meta = "minimum"
//! raw = 100
//! ```

use std::path::{Path, PathBuf};

use epc_bus::BusConfig;
use epc_nv::MetaEnum;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::ccp::CcpSimConfig;

#[derive(Debug, Error)]
pub enum SimConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid hex in memory block at {address:#x}: {source}")]
    Hex {
        address: u32,
        #[source]
        source: hex::FromHexError,
    },
}

/// Memory block preloaded into the CCP slave
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBlock {
    #[serde(deserialize_with = "deserialize_id")]
    pub address: u32,
    pub hex: String,
}

impl MemoryBlock {
    pub fn bytes(&self) -> Result<Vec<u8>, SimConfigError> {
        hex::decode(self.hex.replace(char::is_whitespace, "")).map_err(|source| {
            SimConfigError::Hex {
                address: self.address,
                source,
            }
        })
    }
}

/// Initial content of one parameter slot
#[derive(Debug, Clone, Deserialize)]
pub struct InitialValue {
    pub name: String,
    #[serde(default = "default_meta")]
    pub meta: MetaEnum,
    pub raw: i64,
}

fn default_meta() -> MetaEnum {
    MetaEnum::Value
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimConfig {
    /// Device manifest; without one only the CCP slave runs
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ccp: Option<CcpSimConfig>,
    #[serde(default)]
    pub memory: Vec<MemoryBlock>,
    #[serde(default)]
    pub values: Vec<InitialValue>,
}

impl SimConfig {
    /// Load a TOML file; relative paths resolve against its directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SimConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content)?;
        if let (Some(manifest), Some(dir)) = (&config.manifest, path.parent()) {
            config.manifest = Some(dir.join(manifest));
        }
        Ok(config)
    }
}

/// CAN identifiers written as numbers or `"0x..."` strings
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Number(u32),
        Text(String),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(id) => Ok(id),
        IdRepr::Text(text) => epc_conv::parse_can_id(&text).map_err(serde::de::Error::custom),
    }
}
