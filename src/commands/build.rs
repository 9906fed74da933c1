//! Build command - runs every stage and publishes the image.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::image::{self, ImageManifest, Staging};
use crate::stage::{run_stages, BuildContext, Stage};
use crate::timing::Timer;

/// Options for the build command.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Overrides the recipe's image name.
    pub name: Option<String>,
    /// Rebuild the dependency layer even if a valid one is cached.
    pub no_cache: bool,
}

/// Execute the build command. Returns the published image directory and manifest.
pub async fn cmd_build(
    project_dir: &Path,
    mut config: BuildConfig,
    options: &BuildOptions,
) -> Result<(PathBuf, ImageManifest)> {
    if let Some(name) = &options.name {
        config.name = name.clone();
    }
    config.validate()?;
    let project_dir = &image::absolute(project_dir)?;

    println!("=== Building image '{}' ===\n", config.name);
    let timer = Timer::start("Build");

    let staging = Staging::create(project_dir, &config.name)?;
    let mut ctx = BuildContext::new(project_dir, config, &staging.rootfs())
        .with_no_cache(options.no_cache)
        .with_published_rootfs(&staging.published_rootfs());
    run_stages(&mut ctx).await?;

    let manifest = image::assemble(
        &ctx.config,
        BuildContext::require(&ctx.base, Stage::Base)?.clone(),
        BuildContext::require(&ctx.dependencies, Stage::Dependencies)?.clone(),
        BuildContext::require(&ctx.source, Stage::Source)?.clone(),
        BuildContext::require(&ctx.run_as, Stage::Privilege)?.clone(),
        *BuildContext::require(&ctx.port, Stage::Network)?,
        ctx.completed.clone(),
    )?;
    let image_dir = staging
        .publish(&manifest)
        .with_context(|| format!("Failed to publish image '{}'", manifest.name))?;
    let elapsed = timer.finish();

    println!("\n=== Build Complete ({}) ===", crate::timing::format_duration(elapsed));
    println!("  image:  {}", manifest.image_id);
    println!("  path:   {}", image_dir.display());
    println!("  user:   {} ({})", manifest.user.name, manifest.user.uid);
    println!("\nRun with: pyship run --name {}", manifest.name);

    Ok((image_dir, manifest))
}
