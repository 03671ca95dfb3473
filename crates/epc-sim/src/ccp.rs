//! Simulated CCP slave with a memory image
//!
//! Answers CONNECT, SET_MTA, UPLOAD and DISCONNECT. Memory is addressed in
//! units of `octets_per_unit` octets; unset memory reads as zero.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use epc_bus::{CanBus, CanFrame, MockBus};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT: u8 = 0x01;
const SET_MTA: u8 = 0x02;
const UPLOAD: u8 = 0x04;
const DISCONNECT: u8 = 0x07;

const STATUS_OK: u8 = 0x00;
const STATUS_UNKNOWN_COMMAND: u8 = 0x30;
const STATUS_OUT_OF_RANGE: u8 = 0x32;
const STATUS_NOT_CONNECTED: u8 = 0x33;

/// Identifiers the simulated slave listens and answers on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CcpSimConfig {
    #[serde(deserialize_with = "crate::config::deserialize_id")]
    pub command_id: u32,
    #[serde(deserialize_with = "crate::config::deserialize_id")]
    pub response_id: u32,
    #[serde(default)]
    pub extended: bool,
    #[serde(default)]
    pub station_address: u16,
    #[serde(default = "default_octets_per_unit")]
    pub octets_per_unit: usize,
}

fn default_octets_per_unit() -> usize {
    1
}

impl Default for CcpSimConfig {
    fn default() -> Self {
        Self {
            command_id: 0x700,
            response_id: 0x701,
            extended: false,
            station_address: 0,
            octets_per_unit: 1,
        }
    }
}

#[derive(Debug, Default)]
struct CcpState {
    /// octet address → byte
    memory: BTreeMap<u64, u8>,
    connected: bool,
    mta: u64,
    uploads: usize,
    dropped_uploads: BTreeSet<usize>,
}

/// CCP slave simulator
#[derive(Clone)]
pub struct CcpSimulator {
    config: Arc<CcpSimConfig>,
    state: Arc<Mutex<CcpState>>,
}

impl CcpSimulator {
    pub fn new(config: CcpSimConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::default(),
        }
    }

    pub fn config(&self) -> &CcpSimConfig {
        &self.config
    }

    pub fn attach(&self, bus: &MockBus) {
        let sim = self.clone();
        bus.set_responder(move |frame| sim.handle(frame));
    }

    /// Answer commands from a live bus until `cancel` fires
    pub async fn serve(self, bus: Arc<dyn CanBus>, cancel: CancellationToken) {
        let mut rx = bus.subscribe();
        info!(
            command_id = self.config.command_id,
            response_id = self.config.response_id,
            "CCP simulator serving"
        );
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "CCP simulator lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            for reply in self.handle(&frame) {
                if let Err(e) = bus.send(&reply).await {
                    warn!(error = %e, "CCP simulator reply failed");
                }
            }
        }
        info!("CCP simulator stopped");
    }

    /// Store `bytes` at unit address `address`
    pub fn load(&self, address: u32, bytes: &[u8]) {
        let base = address as u64 * self.config.octets_per_unit as u64;
        let mut state = self.state.lock();
        for (i, byte) in bytes.iter().enumerate() {
            state.memory.insert(base + i as u64, *byte);
        }
    }

    /// Do not answer the UPLOAD with this 0-based index
    ///
    /// The MTA still advances, as if the response was lost on the bus.
    pub fn drop_upload(&self, index: usize) {
        self.state.lock().dropped_uploads.insert(index);
    }

    pub fn uploads(&self) -> usize {
        self.state.lock().uploads
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Replies to one received frame
    pub fn handle(&self, frame: &CanFrame) -> Vec<CanFrame> {
        if !frame.matches(self.config.command_id, self.config.extended) || frame.data.len() < 2 {
            return Vec::new();
        }
        let data = &frame.data;
        let param = |i: usize| data.get(i).copied().unwrap_or(0);
        let (code, counter) = (data[0], data[1]);
        let mut state = self.state.lock();

        let (status, payload) = match code {
            CONNECT => {
                let station = u16::from_le_bytes([param(2), param(3)]);
                if station != self.config.station_address {
                    // another slave's session
                    return Vec::new();
                }
                state.connected = true;
                debug!(station, "CCP connect");
                (STATUS_OK, Vec::new())
            }
            DISCONNECT => {
                state.connected = false;
                debug!("CCP disconnect");
                (STATUS_OK, Vec::new())
            }
            _ if !state.connected => (STATUS_NOT_CONNECTED, Vec::new()),
            SET_MTA => {
                let address = u32::from_be_bytes([param(4), param(5), param(6), param(7)]);
                state.mta = address as u64;
                debug!(address = format_args!("{:#010x}", address), "CCP set MTA");
                (STATUS_OK, Vec::new())
            }
            UPLOAD => {
                let units = param(2) as u64;
                let octets = units as usize * self.config.octets_per_unit;
                if units == 0 || octets > 5 {
                    (STATUS_OUT_OF_RANGE, Vec::new())
                } else {
                    let base = state.mta * self.config.octets_per_unit as u64;
                    let bytes: Vec<u8> = (0..octets as u64)
                        .map(|i| state.memory.get(&(base + i)).copied().unwrap_or(0))
                        .collect();
                    state.mta += units;
                    let index = state.uploads;
                    state.uploads += 1;
                    if state.dropped_uploads.remove(&index) {
                        debug!(index, "Dropping CCP upload response");
                        return Vec::new();
                    }
                    (STATUS_OK, bytes)
                }
            }
            other => {
                warn!(command = other, "Unsupported CCP command");
                (STATUS_UNKNOWN_COMMAND, Vec::new())
            }
        };

        let mut reply = vec![0u8; 8];
        reply[0] = 0xFF;
        reply[1] = status;
        reply[2] = counter;
        reply[3..3 + payload.len()].copy_from_slice(&payload);
        vec![CanFrame::new(
            self.config.response_id,
            self.config.extended,
            reply,
        )]
    }
}
