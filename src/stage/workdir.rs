//! Working directory setup.

use anyhow::{bail, Context, Result};
use std::fs;

use super::{BuildContext, Stage, StageRecord};

/// Stage 2: create the fixed working directory, empty.
pub fn establish_workdir(ctx: &mut BuildContext) -> Result<StageRecord> {
    let workdir = ctx.host_workdir();
    if !workdir.starts_with(&ctx.rootfs) {
        bail!("workdir {} escapes the image rootfs", ctx.config.workdir);
    }

    if workdir.exists() {
        fs::remove_dir_all(&workdir)
            .with_context(|| format!("Failed to clear {}", workdir.display()))?;
    }
    fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create {}", workdir.display()))?;

    ctx.workdir = Some(workdir);
    Ok(StageRecord::done(Stage::Workdir, ctx.config.workdir.clone()))
}
