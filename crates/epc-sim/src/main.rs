//! EPC device simulator
//!
//! Serves the NV parameter protocol and a CCP slave on a CAN interface.
//!
//! # Usage
//!
//! ```bash
//! ./epc-sim --config fixtures/sim.toml --interface vcan0
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use epc_bus::{create_bus, BusConfig};
use epc_nv::{DeviceModel, ProtocolFrames};
use epc_sim::{CcpSimConfig, CcpSimulator, NvSimulator, SimConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "epc-sim")]
#[command(about = "NV and CCP device simulator for EPC development")]
struct Args {
    /// Simulator configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// CAN interface, overrides the configured bus
    #[arg(short, long)]
    interface: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "epc_sim=debug"
    } else {
        "epc_sim=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %args.config.display(), "Loading simulator configuration");
    let mut config = SimConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(interface) = args.interface {
        config.bus = BusConfig::SocketCan { interface };
    }
    if config.bus == BusConfig::Mock {
        warn!("Mock bus selected; nothing outside this process can reach the simulator");
    }
    let bus = create_bus(&config.bus).context("failed to open CAN bus")?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    let mut ccp_config = config.ccp.clone();

    if let Some(manifest) = &config.manifest {
        let model = DeviceModel::load(manifest)
            .with_context(|| format!("failed to load manifest {}", manifest.display()))?;
        let frames = ProtocolFrames::from_matrix(&model.matrix, model.config.variant)
            .context("manifest has no usable NV frames")?;
        let nv = NvSimulator::from_frames(&frames);
        for value in &config.values {
            nv.set_value(&value.name, value.meta, value.raw);
        }

        if ccp_config.is_none() {
            ccp_config = model.manifest.ccp.as_ref().map(|ccp| CcpSimConfig {
                command_id: ccp.command_id,
                response_id: ccp.response_id,
                extended: ccp.extended,
                station_address: ccp.station_address,
                octets_per_unit: (model.config.bits_per_byte / 8) as usize,
            });
        }
        tasks.push(tokio::spawn(nv.serve(bus.clone(), cancel.clone())));
    }

    if let Some(ccp_config) = ccp_config {
        let ccp = CcpSimulator::new(ccp_config);
        for block in &config.memory {
            ccp.load(block.address, &block.bytes()?);
        }
        info!(blocks = config.memory.len(), "CCP memory loaded");
        tasks.push(tokio::spawn(ccp.serve(bus.clone(), cancel.clone())));
    }

    if tasks.is_empty() {
        anyhow::bail!("configuration enables neither an NV device nor a CCP slave");
    }

    info!("Simulator ready - press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Simulator stopped");
    Ok(())
}
