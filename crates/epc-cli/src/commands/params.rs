//! Params command - list what a manifest describes

use std::path::Path;

use anyhow::{Context, Result};
use epc_nv::{DeviceModel, MetaEnum, Parameter};

use crate::output::{OutputContext, ParameterRow};

pub fn params(manifest: &Path, ctx: &OutputContext) -> Result<()> {
    let model = DeviceModel::load(manifest)
        .with_context(|| format!("Failed to load manifest: {}", manifest.display()))?;
    let rows: Vec<ParameterRow> = model
        .registry
        .all_parameters()
        .iter()
        .map(parameter_row)
        .collect();
    ctx.print(&rows);
    Ok(())
}

fn parameter_row(param: &Parameter) -> ParameterRow {
    let flags = param.flags();
    let caps = param.capabilities();
    let mut tags = Vec::new();
    if !caps.readable {
        tags.push("write-only");
    }
    if !caps.writable {
        tags.push("read-only");
    }
    if flags.secret {
        tags.push("secret");
    }
    if flags.is_factory {
        tags.push("factory");
    }
    if flags.is_summary {
        tags.push("summary");
    }

    ParameterRow {
        name: param.name().to_string(),
        group: param.mux_name().to_string(),
        value: if flags.secret {
            String::new()
        } else {
            param.format(MetaEnum::Value)
        },
        unit: param.signal().unit.clone().unwrap_or_default(),
        access: param.access_level().to_string(),
        flags: tags.join(" "),
    }
}
