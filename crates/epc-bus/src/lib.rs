//! epc-bus - CAN transport for EPC devices
//!
//! Provides the [`CanBus`] trait used by the NV and CCP protocols, plus:
//! - [`MockBus`] for tests and simulators
//! - `SocketCanBus` for raw CAN on Linux (feature `socketcan`)

mod bus;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use bus::{BusStatus, CanBus};
pub use epc_conv::CanFrame;
pub use error::BusError;
pub use mock::MockBus;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Bus selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusConfig {
    /// Raw SocketCAN interface (e.g. "can0", "vcan0")
    SocketCan { interface: String },
    /// In-memory bus
    Mock,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::Mock
    }
}

/// Open a bus based on configuration
pub fn create_bus(config: &BusConfig) -> Result<Arc<dyn CanBus>, BusError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        BusConfig::SocketCan { interface } => {
            let bus = socketcan::SocketCanBus::open(interface)?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        BusConfig::SocketCan { .. } => Err(BusError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        BusConfig::Mock => Ok(Arc::new(MockBus::new())),
    }
}
