//! Language dependency installation.
//!
//! Only the manifest (and the files it includes) is copied before this stage
//! runs the installer, and the layer key is derived from the manifest alone.
//! Source edits therefore never invalidate an installed layer.
//!
//! The cached layer is then copied into the image, so a published image
//! never depends on the cache surviving.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use super::source::copy_tree;
use super::{BuildContext, Stage, StageRecord};
use crate::cache::{self, LayerKey};
use crate::config::RuntimeEnv;
use crate::error::BuildError;
use crate::image::{self, DependencyLayer, ResolvedBase, DEPS_PREFIX, IMAGE_LOCK, IMAGE_VENV};
use crate::process::Cmd;
use crate::requirements::Manifest;

pub const LOCK_FILE: &str = "requirements.lock";
pub const VENV_DIR: &str = "venv";

/// Python inside a virtual environment.
pub fn venv_python(venv: &Path) -> PathBuf {
    venv.join("bin").join("python")
}

/// Sorted, trimmed, non-empty lines of `pip freeze` output.
pub fn normalize_lock(freeze_output: &str) -> String {
    let mut lines: Vec<&str> = freeze_output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    lines.sort_unstable();
    lines.dedup();
    let mut lock = lines.join("\n");
    lock.push('\n');
    lock
}

/// Point `#!` lines of the scripts in `bin` that name `from` at `to` instead.
///
/// Console scripts carry the absolute interpreter path of the venv they were
/// installed into. Returns the number of scripts rewritten.
pub fn relocate_scripts(bin: &Path, from: &Path, to: &Path) -> Result<usize> {
    if !bin.is_dir() {
        return Ok(0);
    }
    let old = format!("#!{}/", from.display());
    let new = format!("#!{}/", to.display());

    let mut rewritten = 0;
    for entry in fs::read_dir(bin).with_context(|| format!("Failed to read {}", bin.display()))? {
        let path = entry?.path();
        if path.is_symlink() || !path.is_file() {
            continue;
        }
        let content = fs::read(&path)?;
        let Some(rest) = content.strip_prefix(old.as_bytes()) else {
            continue;
        };
        let mut updated = new.clone().into_bytes();
        updated.extend_from_slice(rest);
        fs::write(&path, updated)
            .with_context(|| format!("Failed to relocate {}", path.display()))?;
        rewritten += 1;
    }
    Ok(rewritten)
}

/// Add read access for everyone below `root`, and traverse/execute access
/// where the owner already has it.
fn grant_read(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.path_is_symlink() {
            continue;
        }
        let meta = entry.metadata()?;
        let mode = meta.permissions().mode();
        let extra = if meta.is_dir() || mode & 0o100 != 0 {
            0o555
        } else {
            0o444
        };
        if mode & extra != extra {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | extra))?;
        }
    }
    Ok(())
}

/// Copy a finished layer into the image rootfs and return the image lock.
fn materialize(ctx: &BuildContext, layer_dir: &Path) -> Result<String> {
    let prefix = image::in_rootfs(&ctx.rootfs, DEPS_PREFIX);
    if prefix.exists() {
        fs::remove_dir_all(&prefix)
            .with_context(|| format!("Failed to clear {}", prefix.display()))?;
    }
    let venv = image::in_rootfs(&ctx.rootfs, IMAGE_VENV);
    fs::create_dir_all(&venv).with_context(|| format!("Failed to create {}", venv.display()))?;

    let files = copy_tree(&layer_dir.join(VENV_DIR), &venv, &[])?;
    let lock = fs::read_to_string(layer_dir.join(LOCK_FILE))
        .with_context(|| format!("Layer {} has no lock file", layer_dir.display()))?;
    fs::write(image::in_rootfs(&ctx.rootfs, IMAGE_LOCK), &lock)?;

    let relocated = relocate_scripts(
        &venv.join("bin"),
        &layer_dir.join(VENV_DIR),
        &image::in_rootfs(&ctx.published_rootfs, IMAGE_VENV),
    )?;

    // Every directory from the rootfs down to the prefix must be traversable.
    let mut dir = prefix.parent();
    while let Some(d) = dir.filter(|d| d.starts_with(&ctx.rootfs)) {
        grant_read_dir(d)?;
        dir = d.parent();
    }
    grant_read(&prefix)?;

    tracing::info!(files, relocated, venv = IMAGE_VENV, "copied dependency layer into image");
    Ok(lock)
}

fn grant_read_dir(dir: &Path) -> Result<()> {
    let mode = fs::metadata(dir)?.permissions().mode();
    if mode & 0o555 != 0o555 {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o555))?;
    }
    Ok(())
}

/// Installer arguments for the self-upgrade step.
fn installer_args(pin: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "--no-cache-dir".to_string(),
    ];
    match pin {
        Some(pin) => args.push(pin.to_string()),
        None => {
            args.push("--upgrade".to_string());
            args.push("pip".to_string());
        }
    }
    args
}

/// Installer arguments for the manifest install step.
fn install_args(manifest: &Path, bytecode_suppressed: bool) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "--no-cache-dir".to_string(),
    ];
    if bytecode_suppressed {
        args.push("--no-compile".to_string());
    }
    args.push("-r".to_string());
    args.push(manifest.to_string_lossy().into_owned());
    args
}

/// Copy the manifest files into the workdir, keeping their relative layout.
///
/// Returns the workdir path of the root manifest.
fn copy_manifest(
    manifest: &Manifest,
    manifest_rel: &Path,
    project_dir: &Path,
    workdir: &Path,
) -> Result<PathBuf> {
    let rel_dir = manifest_rel.parent().unwrap_or(Path::new(""));
    let src_dir = project_dir.join(rel_dir);
    let dst_dir = workdir.join(rel_dir);

    for name in manifest.relative_paths() {
        let src = src_dir.join(name);
        let dst = dst_dir.join(name);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, &dst)
            .with_context(|| format!("Failed to copy {} into workdir", src.display()))?;
    }
    Ok(workdir.join(manifest_rel))
}

struct LayerBuild<'a> {
    base: &'a ResolvedBase,
    env: &'a RuntimeEnv,
    installer: Option<&'a str>,
    manifest: &'a Path,
    timeout: Duration,
}

impl LayerBuild<'_> {
    fn cmd(&self, program: &Path, dir: &Path) -> Cmd {
        Cmd::new(program)
            .dir(dir)
            .runtime_env(self.env)
            .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
            .env("PIP_NO_INPUT", "1")
            .timeout(self.timeout)
    }

    /// Create the venv, install, and return the normalized lock.
    async fn run(&self, layer_dir: &Path) -> Result<String> {
        let venv = layer_dir.join(VENV_DIR);
        let manifest_dir = self.manifest.parent().unwrap_or(Path::new("/"));

        tracing::info!(venv = %venv.display(), "creating virtual environment");
        self.cmd(&self.base.interpreter, layer_dir)
            .args(["-m", "venv"])
            .arg_path(&venv)
            .error_msg("failed to create virtual environment")
            .run()
            .await?;

        let python = venv_python(&venv);
        tracing::info!(installer = self.installer.unwrap_or("pip (latest)"), "upgrading installer");
        self.cmd(&python, layer_dir)
            .args(installer_args(self.installer))
            .error_msg("failed to upgrade the package installer")
            .run()
            .await?;

        tracing::info!(manifest = %self.manifest.display(), "installing dependencies");
        self.cmd(&python, manifest_dir)
            .args(install_args(self.manifest, self.env.suppresses_bytecode()))
            .error_msg("failed to install dependency manifest")
            .run()
            .await?;

        let freeze = self
            .cmd(&python, layer_dir)
            .args(["-m", "pip", "freeze", "--all"])
            .error_msg("failed to freeze installed dependencies")
            .run()
            .await?;
        Ok(normalize_lock(&freeze.stdout))
    }
}

fn image_layer(key: String, lock: &str, requirements: Vec<String>) -> DependencyLayer {
    DependencyLayer {
        key,
        venv: IMAGE_VENV.to_string(),
        lock: IMAGE_LOCK.to_string(),
        lock_digest: cache::hash_bytes(lock.as_bytes()),
        requirements,
    }
}

/// Stage 4: copy the manifest, install it into a cached layer, and copy the
/// layer into the image.
pub async fn install_dependencies(ctx: &mut BuildContext) -> Result<StageRecord> {
    let base = BuildContext::require(&ctx.base, Stage::Base)?.clone();
    let workdir = BuildContext::require(&ctx.workdir, Stage::Workdir)?.clone();

    let manifest_rel = ctx.config.dependencies.manifest.clone();
    let manifest_path = ctx.project_dir.join(&manifest_rel);
    if !manifest_path.is_file() {
        return Err(BuildError::dependency(format!(
            "dependency manifest {} not found",
            manifest_path.display()
        ))
        .into());
    }
    let manifest = Manifest::load(&manifest_path)
        .map_err(|e| BuildError::dependency(format!("{:#}", e)))?;
    for req in manifest.unpinned() {
        tracing::warn!(requirement = %req, line = req.line, "requirement is not pinned");
    }

    let manifest_in_workdir =
        copy_manifest(&manifest, &manifest_rel, &ctx.project_dir, &workdir)?;

    let installer = ctx.config.dependencies.installer.clone();
    let key = LayerKey {
        python_version: &base.version,
        installer: installer.as_deref().unwrap_or("pip"),
        system_packages: &ctx.config.system.packages,
        bytecode: !ctx.env.suppresses_bytecode(),
        manifest_files: &manifest.files,
    }
    .digest();

    let layer_dir = ctx.layers.layer_dir(&key);
    let requirements: Vec<String> = manifest.requirements.iter().map(|r| r.to_string()).collect();

    if !ctx.no_cache && ctx.layers.is_complete(&key) {
        tracing::info!(layer = %key, "using cached dependency layer");
        let lock = materialize(ctx, &layer_dir)?;
        ctx.dependencies = Some(image_layer(key.clone(), &lock, requirements));
        return Ok(StageRecord::cached(Stage::Dependencies, format!("layer {}", &key[..12])));
    }

    let layer_dir = ctx.layers.begin(&key)?;
    let build = LayerBuild {
        base: &base,
        env: &ctx.env,
        installer: installer.as_deref(),
        manifest: &manifest_in_workdir,
        timeout: Duration::from_secs(ctx.config.dependencies.timeout_secs),
    };

    let lock = match build.run(&layer_dir).await {
        Ok(lock) => lock,
        Err(e) => {
            ctx.layers.discard(&key);
            return Err(BuildError::dependency(format!("{:#}", e)).into());
        }
    };

    if let Err(e) = fs::write(layer_dir.join(LOCK_FILE), &lock)
        .map_err(anyhow::Error::from)
        .and_then(|_| ctx.layers.commit(&key))
    {
        ctx.layers.discard(&key);
        return Err(e.context("Failed to finalize dependency layer"));
    }

    materialize(ctx, &layer_dir)?;
    let installed = lock.lines().count();
    ctx.dependencies = Some(image_layer(key.clone(), &lock, requirements));
    Ok(StageRecord::done(
        Stage::Dependencies,
        format!("{} package(s), layer {}", installed, &key[..12]),
    ))
}
