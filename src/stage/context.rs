//! Build context shared across all stages.
//!
//! Holds the inputs of a build and the outputs each stage hands to the next.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::{Stage, StageRecord};
use crate::cache::LayerCache;
use crate::config::{BuildConfig, RuntimeEnv, OUTPUT_DIR};
use crate::image::{self, DependencyLayer, ExposedPort, Identity, ResolvedBase, SourceTree};

pub struct BuildContext {
    /// Project tree being packaged.
    pub project_dir: PathBuf,
    pub config: BuildConfig,
    /// Environment applied to every command a stage runs.
    pub env: RuntimeEnv,
    /// Rootfs of the image under construction.
    pub rootfs: PathBuf,
    /// Absolute path the rootfs will have once the image is published.
    pub published_rootfs: PathBuf,
    pub layers: LayerCache,
    /// Rebuild the dependency layer even when a valid one exists.
    pub no_cache: bool,

    /// Completed stages, in order.
    pub completed: Vec<StageRecord>,

    pub base: Option<ResolvedBase>,
    pub workdir: Option<PathBuf>,
    pub dependencies: Option<DependencyLayer>,
    pub source: Option<SourceTree>,
    pub identity: Option<Identity>,
    /// Identity every later process runs as; set by the privilege stage.
    pub run_as: Option<Identity>,
    pub port: Option<ExposedPort>,
}

impl BuildContext {
    pub fn new(project_dir: &Path, config: BuildConfig, rootfs: &Path) -> Self {
        let env = config.runtime_env();
        let layers = LayerCache::new(&config.cache_root());
        Self {
            project_dir: project_dir.to_path_buf(),
            config,
            env,
            rootfs: rootfs.to_path_buf(),
            published_rootfs: rootfs.to_path_buf(),
            layers,
            no_cache: false,
            completed: Vec::new(),
            base: None,
            workdir: None,
            dependencies: None,
            source: None,
            identity: None,
            run_as: None,
            port: None,
        }
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_published_rootfs(mut self, rootfs: &Path) -> Self {
        self.published_rootfs = rootfs.to_path_buf();
        self
    }

    /// Host path of the image working directory.
    pub fn host_workdir(&self) -> PathBuf {
        image::in_rootfs(&self.rootfs, &self.config.workdir)
    }

    /// The tool's own output directory, never copied into an image.
    pub fn output_dir(&self) -> PathBuf {
        self.project_dir.join(OUTPUT_DIR)
    }

    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed.iter().any(|r| r.stage == stage)
    }

    /// Output of an earlier stage; absence means the pipeline was misordered.
    pub fn require<'a, T>(value: &'a Option<T>, stage: Stage) -> Result<&'a T> {
        value
            .as_ref()
            .with_context(|| format!("'{}' stage output missing", stage))
    }
}
