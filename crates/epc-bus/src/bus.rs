//! CAN bus trait and types

use async_trait::async_trait;
use epc_conv::CanFrame;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::BusError;

/// Link state of the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusStatus {
    Online,
    Offline,
}

/// Transport-agnostic interface to a CAN bus
///
/// Protocols never read from the bus directly. They subscribe to the
/// broadcast of received frames before sending a request, then filter the
/// frames they care about.
#[async_trait]
pub trait CanBus: Send + Sync {
    /// Transmit one frame
    async fn send(&self, frame: &CanFrame) -> Result<(), BusError>;

    /// Subscribe to every frame received from now on
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Watch the link state
    fn status(&self) -> watch::Receiver<BusStatus>;

    /// Whether the bus is currently online
    fn is_online(&self) -> bool {
        *self.status().borrow() == BusStatus::Online
    }
}

/// Reject payloads a classic CAN frame cannot carry
pub(crate) fn check_frame(frame: &CanFrame) -> Result<(), BusError> {
    if frame.data.len() > 8 {
        return Err(BusError::InvalidFrame(format!(
            "{} bytes exceed the 8-byte CAN payload",
            frame.data.len()
        )));
    }
    let limit = if frame.extended { 0x1FFF_FFFF } else { 0x7FF };
    if frame.id > limit {
        return Err(BusError::InvalidFrame(format!(
            "identifier 0x{:X} out of range",
            frame.id
        )));
    }
    Ok(())
}
