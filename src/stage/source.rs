//! Application file tree copy.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{BuildContext, Stage, StageRecord};
use crate::cache;
use crate::image::SourceTree;

/// Copy `src` into `dst` recursively, preserving permissions and symlinks.
///
/// Paths under any of `exclude` are skipped. Returns the number of regular
/// files copied.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[PathBuf]) -> Result<usize> {
    let mut files = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|x| e.path().starts_with(x)));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walkdir yielded a path outside the source")?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)
                .with_context(|| format!("Failed to create symlink {}", target.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let mode = entry.metadata()?.permissions();
            fs::set_permissions(&target, mode)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            files += 1;
        }
    }
    Ok(files)
}

/// Where `path` sits inside `project_dir`, spelled the way a walk of
/// `project_dir` yields it. Both are resolved first, so a relative project or
/// a symlinked spelling still matches.
fn inside_project(project_dir: &Path, path: &Path) -> Option<PathBuf> {
    let project = fs::canonicalize(project_dir).ok()?;
    let path = fs::canonicalize(path).ok()?;
    path.strip_prefix(&project).ok().map(|rel| project_dir.join(rel))
}

/// Stage 5: copy the full application tree into the workdir.
pub fn copy_source_tree(ctx: &mut BuildContext) -> Result<StageRecord> {
    let workdir = BuildContext::require(&ctx.workdir, Stage::Workdir)?.clone();
    BuildContext::require(&ctx.dependencies, Stage::Dependencies)?;

    let mut exclude = vec![ctx.output_dir()];
    if let Some(cache) = inside_project(&ctx.project_dir, &ctx.config.cache_root()) {
        tracing::debug!(cache = %cache.display(), "excluding layer cache from the source copy");
        exclude.push(cache);
    }

    let files = copy_tree(&ctx.project_dir, &workdir, &exclude)?;
    let digest = cache::hash_tree(&workdir, &[])?;
    tracing::info!(files, digest = %&digest[..12], "copied application tree");

    ctx.source = Some(SourceTree {
        digest: digest.clone(),
        files,
    });
    Ok(StageRecord::done(
        Stage::Source,
        format!("{} file(s), digest {}", files, &digest[..12]),
    ))
}
