//! epc-nv - NV parameter access for EPC devices
//!
//! Builds a registry of non-volatile parameters from a CAN matrix and keeps
//! it synchronised with the device over a request/response protocol:
//!
//! - [`Registry`]: parameters, their five meta slots and the group tree
//! - [`NvProtocol`]: read/write requests with per-key serialisation,
//!   timeouts, retries and cancellation
//! - [`TransactionManager`]: staged edits committed as one write per meta
//! - [`CyclicReader`]: background refresh with pause tokens
//! - [`files`]: `.epp` and `.pmvs` parameter files
//! - [`NvDevice`]: everything above, opened from a device manifest
//!
//! # Example
//!
//! ```rust,no_run
//! use epc_bus::{create_bus, BusConfig};
//! use epc_nv::{MetaEnum, NvDevice};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = create_bus(&BusConfig::SocketCan { interface: "can0".into() })?;
//! let device = NvDevice::open("inverter.json", bus)?;
//!
//! let echo = device.read("FrequencyReference", MetaEnum::Value).await?;
//! println!("raw {}", echo.raw);
//!
//! device.start_cyclic();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod cyclic;
pub mod device;
pub mod error;
pub mod files;
pub mod meta;
pub mod pause;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use config::{CcpSettings, DeviceConfig, DeviceManifest, NodeIdPolicy, ProtocolVariant};
pub use cyclic::CyclicReader;
pub use device::{DeviceModel, NvDevice};
pub use error::{ConfigError, NvError, NvResult};
pub use files::{LoadReport, ValueSet, ValueSetEntry};
pub use meta::MetaEnum;
pub use pause::{PauseGate, PauseToken};
pub use protocol::{Echo, NvProtocol, ProtocolFrames, RequestContext};
pub use registry::{
    Capabilities, GroupId, ParamFlags, ParamId, Parameter, Registry, RegistryEvent, SharedRegistry,
};
pub use scheduler::{Priority, RequestScheduler};
pub use transaction::{CommitReport, Outcome, TransactionManager};
