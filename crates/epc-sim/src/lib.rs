//! epc-sim - device simulators for EPC protocol development
//!
//! - [`NvSimulator`]: answers NV set frames from an in-memory parameter store
//! - [`CcpSimulator`]: CCP slave serving uploads from a memory image
//!
//! Both attach to a [`epc_bus::MockBus`] for tests or serve a live bus.

pub mod ccp;
pub mod config;
pub mod nv;

pub use ccp::{CcpSimConfig, CcpSimulator};
pub use config::{InitialValue, MemoryBlock, SimConfig, SimConfigError};
pub use nv::NvSimulator;
