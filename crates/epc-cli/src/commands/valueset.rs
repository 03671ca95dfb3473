//! Valueset command - build value sets from overlay recipes
//!
//! The configuration lists recipes; each one loads a base `.pmvs`, lays the
//! overlays over it in order and writes the result:
//!
//! ```json
//! {
//!   "recipes": [
//!     { "output": "out/customer.pmvs", "base": "factory.pmvs",
//!       "overlays": ["region-eu.pmvs", "customer.pmvs"] }
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the configuration file. TOML is
//! accepted too (`[[recipes]]`), chosen by extension.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use epc_nv::ValueSet;
use serde::Deserialize;
use tracing::{error, info};

use crate::output::{OutputContext, RecipeRow};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Recipe {
    pub output: PathBuf,
    pub base: PathBuf,
    #[serde(default)]
    pub overlays: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecipeFile {
    #[serde(default)]
    pub recipes: Vec<Recipe>,
}

impl RecipeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
        let mut file: RecipeFile = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?,
            _ => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?,
        };

        let dir = path.parent().unwrap_or(Path::new("."));
        for recipe in &mut file.recipes {
            recipe.output = dir.join(&recipe.output);
            recipe.base = dir.join(&recipe.base);
            for overlay in &mut recipe.overlays {
                *overlay = dir.join(&*overlay);
            }
        }
        Ok(file)
    }
}

impl Recipe {
    /// `base ⊕ overlay₁ ⊕ overlay₂ ⊕ …`
    pub fn build(&self) -> Result<ValueSet> {
        let mut set = ValueSet::load(&self.base)
            .with_context(|| format!("Failed to load base value set: {}", self.base.display()))?;
        for overlay in &self.overlays {
            let layer = ValueSet::load(overlay)
                .with_context(|| format!("Failed to load overlay: {}", overlay.display()))?;
            set.overlay(&layer);
        }
        Ok(set)
    }

    /// Build and write the output, returning the parameter count
    pub fn apply(&self) -> Result<usize> {
        let set = self.build()?;
        set.save(&self.output)
            .with_context(|| format!("Failed to write {}", self.output.display()))?;
        Ok(set.len())
    }
}

/// Run every recipe; a failure does not stop the others
pub fn valueset(configuration: &Path, ctx: &OutputContext) -> Result<()> {
    let file = RecipeFile::load(configuration)?;
    info!(recipes = file.recipes.len(), "Building value sets");

    let mut rows = Vec::with_capacity(file.recipes.len());
    let mut failed = 0;
    for recipe in &file.recipes {
        let output = recipe.output.display().to_string();
        match recipe.apply() {
            Ok(parameters) => rows.push(RecipeRow {
                output,
                parameters,
                status: "written".to_string(),
            }),
            Err(e) => {
                error!(output = %output, error = %format!("{:#}", e), "Recipe failed");
                ctx.error(&format!("{}: {:#}", output, e));
                failed += 1;
                rows.push(RecipeRow {
                    output,
                    parameters: 0,
                    status: format!("failed: {:#}", e),
                });
            }
        }
    }
    ctx.print(&rows);

    if failed > 0 {
        anyhow::bail!("{} of {} recipes failed", failed, file.recipes.len());
    }
    ctx.success(&format!("{} value sets written", file.recipes.len()));
    Ok(())
}
