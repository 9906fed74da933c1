//! Clean command - removes images and cached layers.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::cache::LayerCache;
use crate::config::BuildConfig;
use crate::image;

/// Clean target for the clean command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    /// Published images of this project (default)
    Images,
    /// Dependency layer cache
    Cache,
    /// Images and cache
    All,
}

/// Remove every published and partial image of a project.
pub fn clean_images(project_dir: &Path) -> Result<()> {
    let images = image::images_dir(project_dir);
    if images.exists() {
        println!("Removing {}...", images.display());
        fs::remove_dir_all(&images)
            .with_context(|| format!("Failed to remove {}", images.display()))?;
    }
    Ok(())
}

/// Remove every cached dependency layer.
pub fn clean_cache(config: &BuildConfig) -> Result<()> {
    let layers = LayerCache::new(&config.cache_root());
    println!("Clearing dependency layers ({})...", layers.root().display());
    layers.clear()
}

/// Execute the clean command.
pub fn cmd_clean(project_dir: &Path, target: CleanTarget, config: &BuildConfig) -> Result<()> {
    match target {
        CleanTarget::Images => clean_images(project_dir)?,
        CleanTarget::Cache => clean_cache(config)?,
        CleanTarget::All => {
            clean_images(project_dir)?;
            clean_cache(config)?;
        }
    }
    println!("Clean complete.");
    Ok(())
}
