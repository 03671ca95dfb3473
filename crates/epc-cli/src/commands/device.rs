//! Read, write and save commands - talk to a device over CAN

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use epc_bus::{create_bus, BusConfig};
use epc_nv::{MetaEnum, NvDevice, Outcome};

use crate::output::{OutputContext, SlotRow};

/// Meta slot selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetaArg {
    Value,
    UserDefault,
    FactoryDefault,
    Minimum,
    Maximum,
}

impl From<MetaArg> for MetaEnum {
    fn from(meta: MetaArg) -> Self {
        match meta {
            MetaArg::Value => MetaEnum::Value,
            MetaArg::UserDefault => MetaEnum::UserDefault,
            MetaArg::FactoryDefault => MetaEnum::FactoryDefault,
            MetaArg::Minimum => MetaEnum::Minimum,
            MetaArg::Maximum => MetaEnum::Maximum,
        }
    }
}

/// Open the manifest's device on a SocketCAN interface
pub fn open_device(manifest: &Path, interface: &str) -> Result<NvDevice> {
    let bus = create_bus(&BusConfig::SocketCan {
        interface: interface.to_string(),
    })
    .with_context(|| format!("Failed to open CAN interface {}", interface))?;
    NvDevice::open(manifest, bus)
        .with_context(|| format!("Failed to load manifest: {}", manifest.display()))
}

/// Read slots of one parameter; every meta when none is given
pub async fn read(
    device: &NvDevice,
    name: &str,
    metas: &[MetaArg],
    ctx: &OutputContext,
) -> Result<()> {
    let metas: Vec<MetaEnum> = if metas.is_empty() {
        MetaEnum::ALL
            .into_iter()
            .filter(|m| device.config().supports(*m))
            .collect()
    } else {
        metas.iter().copied().map(MetaEnum::from).collect()
    };
    let signal = {
        let id = device.lookup(name)?;
        device.registry().read().param(id)?.signal().clone()
    };

    let mut rows = Vec::with_capacity(metas.len());
    for meta in metas {
        let echo = device
            .read(name, meta)
            .await
            .with_context(|| format!("Failed to read {} ({})", name, meta))?;
        rows.push(SlotRow {
            parameter: name.to_string(),
            meta: meta.to_string(),
            value: signal.format_value(echo.raw),
            raw: echo.raw.to_string(),
        });
    }
    ctx.print(&rows);
    Ok(())
}

/// Write one slot; `value` is a physical number or an enumeration label
pub async fn write(
    device: &NvDevice,
    name: &str,
    value: &str,
    meta: MetaArg,
    save: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let meta = MetaEnum::from(meta);
    let raw = {
        let id = device.lookup(name)?;
        let registry = device.registry().read();
        registry
            .param(id)?
            .signal()
            .parse_value(value)
            .with_context(|| format!("Invalid value for {}: {}", name, value))?
    };

    let report = device
        .write(name, meta, raw)
        .await
        .with_context(|| format!("Failed to write {} ({})", name, meta))?;
    for outcome in report.outcomes.values() {
        match outcome {
            Outcome::Written(echoed) => ctx.success(&format!(
                "{} ({}) = {} (raw {})",
                name, meta, value, echoed
            )),
            Outcome::Failed(reason) => anyhow::bail!("Write of {} failed: {}", name, reason),
            Outcome::Aborted => anyhow::bail!("Write of {} was not sent", name),
        }
    }

    if save {
        save_to_nv(device, ctx).await?;
    }
    Ok(())
}

pub async fn save_to_nv(device: &NvDevice, ctx: &OutputContext) -> Result<()> {
    device
        .save_to_nv()
        .await
        .context("Failed to save parameters to non-volatile memory")?;
    ctx.success("Parameters saved to non-volatile memory");
    Ok(())
}
