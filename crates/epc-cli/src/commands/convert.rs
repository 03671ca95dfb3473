//! Convert command - `.epp` ⇄ `.pmvs`

use std::path::Path;

use anyhow::{Context, Result};
use epc_nv::files::{load_epp, save_epp};
use epc_nv::{DeviceModel, LoadReport, ValueSet};

use crate::output::OutputContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Epp,
    Pmvs,
}

fn kind(path: &Path) -> Result<FileKind> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("epp") => Ok(FileKind::Epp),
        Some("pmvs") => Ok(FileKind::Pmvs),
        _ => anyhow::bail!(
            "Unsupported parameter file {} (expected .epp or .pmvs)",
            path.display()
        ),
    }
}

/// Load `input` into the manifest's registry and write it back as `output`
///
/// The registry does the translation, so names the matrix does not know are
/// dropped and reported.
pub fn convert(manifest: &Path, input: &Path, output: &Path, ctx: &OutputContext) -> Result<LoadReport> {
    let (from, to) = (kind(input)?, kind(output)?);
    let mut model = DeviceModel::load(manifest)
        .with_context(|| format!("Failed to load manifest: {}", manifest.display()))?;

    let report = match from {
        FileKind::Epp => load_epp(input, &mut model.registry),
        FileKind::Pmvs => ValueSet::load(input).and_then(|set| set.apply_to(&mut model.registry)),
    }
    .with_context(|| format!("Failed to load {}", input.display()))?;

    match to {
        FileKind::Epp => save_epp(output, &model.registry),
        FileKind::Pmvs => ValueSet::from_registry(&model.registry).save(output),
    }
    .with_context(|| format!("Failed to write {}", output.display()))?;

    for name in &report.unknown {
        ctx.warn(&format!("Unknown parameter dropped: {}", name));
    }
    for name in &report.invalid {
        ctx.warn(&format!("Invalid value dropped: {}", name));
    }
    ctx.success(&format!(
        "Converted {} -> {} ({} values)",
        input.display(),
        output.display(),
        report.applied
    ));
    Ok(report)
}
