//! Integration tests for the EPC crates
//!
//! Devices from the `epc-sim` fixtures run against the simulators on a
//! [`MockBus`]:
//!
//! - `nv_test`: reads, writes and transactions over both NV variants
//! - `cyclic_test`: background refresh and pause tokens
//! - `ccp_test`: bulk reads into the memory cache and datalog decoding
//!
//! Run with: cargo test -p epc-tests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use epc_bus::MockBus;
use epc_ccp::{CcpClient, CcpConfig};
use epc_conv::{unpack, SignalValues};
use epc_nv::protocol::READ_COMMAND;
use epc_nv::{DeviceManifest, DeviceModel, MetaEnum, NvDevice, NvResult, ParamId, ProtocolFrames};
use epc_sim::{CcpSimConfig, CcpSimulator, NvSimulator};

/// Path of a file in the shared fixture directory
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../epc-sim/fixtures")
        .join(name)
}

/// A device and its simulator sharing one mock bus
pub struct NvBench {
    pub bus: Arc<MockBus>,
    pub sim: NvSimulator,
    pub device: NvDevice,
}

impl NvBench {
    /// Open a fixture manifest; must be called within a Tokio runtime
    pub fn open(manifest: &str) -> NvResult<Self> {
        let model = DeviceModel::load(fixture(manifest))?;
        let frames = ProtocolFrames::from_matrix(&model.matrix, model.config.variant)?;
        let sim = NvSimulator::from_frames(&frames);
        let bus = MockBus::shared();
        sim.attach(&bus);
        let device = NvDevice::from_model(model, bus.clone())?;
        Ok(Self { bus, sim, device })
    }

    pub fn id(&self, name: &str) -> NvResult<ParamId> {
        self.device.lookup(name)
    }

    /// Put a slot into the local registry without talking to the device
    pub fn preset(&self, name: &str, meta: MetaEnum, raw: i64) -> NvResult<()> {
        let id = self.id(name)?;
        self.device.registry().write().set_meta(id, meta, raw, false)
    }

    /// Decoded set frames sent so far
    pub fn requests(&self) -> Vec<SignalValues> {
        let set = &self.device.protocol().frames().set;
        self.bus
            .sent_with_id(set.id)
            .iter()
            .filter_map(|frame| unpack(set, &frame.data).ok())
            .collect()
    }

    /// `(mux, meta)` of every write request, in send order
    pub fn writes(&self) -> Vec<(i64, i64)> {
        self.requests()
            .iter()
            .filter(|r| r.get(READ_COMMAND) == Some(&0))
            .map(|r| {
                (
                    r.get("MUX").copied().unwrap_or(-1),
                    r.get("Meta").copied().unwrap_or(MetaEnum::Value.tag()),
                )
            })
            .collect()
    }
}

/// CCP client for the inverter fixture talking to a simulated slave
pub fn ccp_bench() -> Result<(Arc<MockBus>, CcpSimulator, CcpClient), Box<dyn std::error::Error>> {
    let manifest = DeviceManifest::from_file(&fixture("inverter.json"))?;
    let settings = manifest.ccp.ok_or("inverter fixture has no CCP section")?;

    let sim = CcpSimulator::new(CcpSimConfig {
        command_id: settings.command_id,
        response_id: settings.response_id,
        extended: settings.extended,
        station_address: settings.station_address,
        ..CcpSimConfig::default()
    });
    let bus = MockBus::shared();
    sim.attach(&bus);

    let config = CcpConfig::new(settings.command_id, settings.response_id, settings.extended)
        .with_station_address(settings.station_address)
        .with_bits_per_byte(manifest.bits_per_byte.unwrap_or(8));
    let client = CcpClient::new(bus.clone(), config);
    Ok((bus, sim, client))
}
