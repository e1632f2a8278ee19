//! Manifest loading: TOML on disk into the typed [`Manifest`] structure.

use std::path::Path;

use anyhow::{Context, Result};
use wave_core::types::Manifest;

pub fn load(path: &Path) -> Result<Manifest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest '{}'", path.display()))?;
    let manifest: Manifest = toml::from_str(&text)
        .with_context(|| format!("failed to parse manifest '{}'", path.display()))?;
    Ok(manifest)
}
