//! Device configuration
//!
//! The device manifest is a JSON file next to the CAN matrix. It is parsed
//! into [`DeviceManifest`] and folded into a [`DeviceConfig`], the explicit
//! configuration handed to the registry and protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

use epc_conv::CanMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::meta::MetaEnum;

// =============================================================================
// Protocol variant and addressing
// =============================================================================

/// NV wire protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// `CommandSetNVParam` / `StatusNVParam`, value slot only
    #[default]
    #[serde(rename = "original", alias = "legacy")]
    Legacy,
    /// `ParameterQuery` / `ParameterResponse` with a `Meta` selector
    #[serde(rename = "j1939", alias = "extended")]
    Extended,
}

impl ProtocolVariant {
    pub fn set_frame(self) -> &'static str {
        match self {
            ProtocolVariant::Legacy => "CommandSetNVParam",
            ProtocolVariant::Extended => "ParameterQuery",
        }
    }

    pub fn status_frame(self) -> &'static str {
        match self {
            ProtocolVariant::Legacy => "StatusNVParam",
            ProtocolVariant::Extended => "ParameterResponse",
        }
    }

    /// Name of the meta selector signal, if the variant has one
    pub fn meta_signal(self) -> Option<&'static str> {
        match self {
            ProtocolVariant::Legacy => None,
            ProtocolVariant::Extended => Some("Meta"),
        }
    }
}

/// Addressing policy for source/destination bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeIdPolicy {
    /// Identifiers are used as written in the matrix
    #[default]
    Simple,
    /// J1939: bits 8..15 carry the destination, bits 0..7 the source
    J1939,
}

// =============================================================================
// Manifest
// =============================================================================

/// CCP endpoint settings carried by the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcpSettings {
    /// Command Receive Object identifier (host → device)
    #[serde(deserialize_with = "deserialize_id")]
    pub command_id: u32,
    /// Data Transmission Object identifier (device → host)
    #[serde(deserialize_with = "deserialize_id")]
    pub response_id: u32,
    #[serde(default)]
    pub station_address: u16,
    #[serde(default)]
    pub extended: bool,
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Number(u32),
        Text(String),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(id) => Ok(id),
        IdRepr::Text(s) => epc_conv::parse_can_id(&s).map_err(serde::de::Error::custom),
    }
}

/// Device manifest as found on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceManifest {
    /// CAN matrix file (YAML or JSON)
    pub can_path: PathBuf,
    #[serde(default)]
    pub node_id_type: NodeIdPolicy,
    #[serde(default)]
    pub node_id: u8,
    #[serde(default)]
    pub controller_id: u8,
    #[serde(default)]
    pub nv_configuration: ProtocolVariant,
    /// `;`-separated path to the access-level signal
    #[serde(default)]
    pub access_level_path: Option<String>,
    /// `;`-separated path to the access-password signal
    #[serde(default)]
    pub access_password_path: Option<String>,
    /// `"Meta"` enables the full meta set
    #[serde(default)]
    pub nv_meta_enum: Option<String>,
    /// Group tree, inline or as a path to a JSON file
    #[serde(default)]
    pub parameter_hierarchy: Option<serde_json::Value>,
    /// JSON file mapping parameter names to default values
    #[serde(default)]
    pub parameter_defaults: Option<PathBuf>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_retries: Option<u32>,
    #[serde(default)]
    pub send_delay_ms: Option<u64>,
    #[serde(default)]
    pub cyclic_delay_ms: Option<u64>,
    #[serde(default)]
    pub bits_per_byte: Option<u32>,
    #[serde(default)]
    pub ccp: Option<CcpSettings>,

    /// Directory the manifest was loaded from; relative paths resolve here
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl DeviceManifest {
    /// Load a manifest from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = Self::from_json(&content)?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Resolve a manifest-relative path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Load the CAN matrix named by `can_path`
    pub fn load_matrix(&self) -> Result<CanMatrix, ConfigError> {
        let path = self.resolve(&self.can_path);
        CanMatrix::from_file(&path).map_err(|e| match e {
            epc_conv::CodecError::IoError(source) => ConfigError::Io { path, source },
            other => ConfigError::Matrix(other),
        })
    }

    /// Load the `parameter_defaults` file, if any
    pub fn load_defaults(&self) -> Result<Option<serde_json::Map<String, serde_json::Value>>, ConfigError> {
        let Some(rel) = &self.parameter_defaults else {
            return Ok(None);
        };
        let path = self.resolve(rel);
        let content = read_file(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn load_hierarchy(&self) -> Result<Option<serde_json::Value>, ConfigError> {
        match &self.parameter_hierarchy {
            Some(serde_json::Value::String(rel)) => {
                let path = self.resolve(Path::new(rel));
                let content = read_file(&path)?;
                Ok(Some(serde_json::from_str(&content)?))
            }
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(inline) => Ok(Some(inline.clone())),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// =============================================================================
// Device configuration
// =============================================================================

fn default_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_retries() -> u32 {
    3
}

fn default_cyclic_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_bits_per_byte() -> u32 {
    8
}

/// Explicit device configuration passed to registry and protocol construction
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub variant: ProtocolVariant,
    /// Metas the device supports, in tag order
    pub metas: Vec<MetaEnum>,
    pub node_id_policy: NodeIdPolicy,
    pub node_id: u8,
    pub controller_id: u8,
    pub access_level_path: Option<String>,
    pub access_password_path: Option<String>,
    pub hierarchy: Option<serde_json::Value>,
    pub request_timeout: Duration,
    pub request_retries: u32,
    /// Pause before each transmitted request
    pub send_delay: Duration,
    /// Pause between background reads
    pub cyclic_delay: Duration,
    /// Bits per addressable memory unit on the device
    pub bits_per_byte: u32,
    /// Reject staged values outside `[minimum, maximum]`
    pub enforce_range: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(ProtocolVariant::default())
    }
}

impl DeviceConfig {
    /// Defaults for a protocol variant; extended devices get the full meta set
    pub fn new(variant: ProtocolVariant) -> Self {
        let metas = match variant {
            ProtocolVariant::Legacy => vec![MetaEnum::Value],
            ProtocolVariant::Extended => MetaEnum::ALL.to_vec(),
        };
        Self {
            variant,
            metas,
            node_id_policy: NodeIdPolicy::Simple,
            node_id: 0,
            controller_id: 0,
            access_level_path: None,
            access_password_path: None,
            hierarchy: None,
            request_timeout: default_timeout(),
            request_retries: default_retries(),
            send_delay: Duration::ZERO,
            cyclic_delay: default_cyclic_delay(),
            bits_per_byte: default_bits_per_byte(),
            enforce_range: true,
        }
    }

    /// Fold a manifest into a configuration
    pub fn from_manifest(manifest: &DeviceManifest) -> Result<Self, ConfigError> {
        let variant = manifest.nv_configuration;
        let metas = match (variant, manifest.nv_meta_enum.as_deref()) {
            (ProtocolVariant::Legacy, _) => vec![MetaEnum::Value],
            (ProtocolVariant::Extended, Some("Meta")) => MetaEnum::ALL.to_vec(),
            (ProtocolVariant::Extended, Some(other)) => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported nv_meta_enum {:?}",
                    other
                )))
            }
            (ProtocolVariant::Extended, None) => vec![MetaEnum::Value],
        };

        let bits_per_byte = manifest.bits_per_byte.unwrap_or_else(default_bits_per_byte);
        if bits_per_byte == 0 || bits_per_byte % 8 != 0 {
            return Err(ConfigError::Invalid(format!(
                "bits_per_byte must be a non-zero multiple of 8, got {}",
                bits_per_byte
            )));
        }

        Ok(Self {
            variant,
            metas,
            node_id_policy: manifest.node_id_type,
            node_id: manifest.node_id,
            controller_id: manifest.controller_id,
            access_level_path: manifest.access_level_path.clone(),
            access_password_path: manifest.access_password_path.clone(),
            hierarchy: manifest.load_hierarchy()?,
            request_timeout: manifest
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(default_timeout),
            request_retries: manifest.request_retries.unwrap_or_else(default_retries),
            send_delay: manifest
                .send_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO),
            cyclic_delay: manifest
                .cyclic_delay_ms
                .map(Duration::from_millis)
                .unwrap_or_else(default_cyclic_delay),
            bits_per_byte,
            enforce_range: true,
        })
    }

    /// Whether the device supports `meta`
    pub fn supports(&self, meta: MetaEnum) -> bool {
        self.metas.contains(&meta)
    }

    /// Rewrite the NV frame identifiers for the addressing policy
    ///
    /// With J1939 addressing the set frame is addressed to the device
    /// (`node_id`) from the host (`controller_id`) and the status frame the
    /// other way round.
    pub fn apply_addressing(&self, matrix: &mut CanMatrix) -> Result<(), ConfigError> {
        if self.node_id_policy == NodeIdPolicy::Simple {
            return Ok(());
        }

        let address = |id: u32, destination: u8, source: u8| {
            (id & !0xFFFF) | ((destination as u32) << 8) | source as u32
        };
        for (name, destination, source) in [
            (self.variant.set_frame(), self.node_id, self.controller_id),
            (self.variant.status_frame(), self.controller_id, self.node_id),
        ] {
            let frame = matrix
                .find_frame(name)
                .ok_or_else(|| ConfigError::MissingFrame(name.to_string()))?;
            let id = address(frame.id, destination, source);
            matrix.set_frame_id(name, id)?;
            tracing::debug!(frame = name, id = format!("0x{:08X}", id), "Applied J1939 addressing");
        }
        Ok(())
    }
}
