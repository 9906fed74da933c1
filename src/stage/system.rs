//! System-level build dependencies.
//!
//! Installs only the native toolchain packages needed to build extensions of
//! later dependencies. Packages go to the build host, whose interpreter builds
//! the layer; the image records their names. Host package-index caches are
//! purged afterwards only when `system.purge` names them. Re-running the stage
//! installs nothing new and leaves those caches empty again.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{BuildContext, Stage, StageRecord};
use crate::error::BuildError;
use crate::process::Cmd;

/// Stage 3: install system packages and purge any configured package indexes.
pub async fn install_system_packages(ctx: &mut BuildContext) -> Result<StageRecord> {
    let system = &ctx.config.system;
    if system.packages.is_empty() {
        tracing::info!("no system packages requested");
        return Ok(StageRecord::skipped(Stage::System, "no packages"));
    }

    let timeout = Duration::from_secs(ctx.config.dependencies.timeout_secs);

    if !system.refresh.is_empty() {
        Cmd::from_argv(&system.refresh)?
            .runtime_env(&ctx.env)
            .timeout(timeout)
            .error_msg("package index refresh failed")
            .run()
            .await
            .map_err(|e| BuildError::dependency(format!("{:#}", e)))?;
    }

    let install = Cmd::from_argv(&system.install)?
        .args(&system.packages)
        .runtime_env(&ctx.env)
        .timeout(timeout)
        .error_msg(format!(
            "failed to install system packages {}",
            system.packages.join(" ")
        ));
    tracing::info!(command = %install.display(), "installing system packages");
    install
        .run()
        .await
        .map_err(|e| BuildError::dependency(format!("{:#}", e)))?;

    if !system.purge.is_empty() {
        let mut purged = 0;
        for dir in &system.purge {
            tracing::warn!(dir = %dir.display(), "purging host package index cache");
            purged += purge_dir_contents(dir)?;
        }
        tracing::info!(entries = purged, "purged package index caches");
    }

    Ok(StageRecord::done(
        Stage::System,
        system.packages.join(" "),
    ))
}

/// Remove everything inside `dir`, keeping `dir` itself. Missing is fine.
pub fn purge_dir_contents(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let result = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.with_context(|| format!("Failed to purge {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}
