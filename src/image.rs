//! Published images.
//!
//! An image is a directory holding `image.json` and a `rootfs/` tree. It is
//! assembled in a hidden staging directory and renamed into place only after
//! every stage succeeded, so a failed build never leaves a loadable image.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache;
use crate::config::{BuildConfig, EnvRequirement, OUTPUT_DIR};
use crate::error::BuildError;
use crate::stage::StageRecord;

pub const MANIFEST_FILE: &str = "image.json";
pub const ROOTFS_DIR: &str = "rootfs";
pub const SCHEMA_VERSION: u32 = 2;

/// In-image directory holding the dependency environment. Owned by the
/// builder and only readable by the execution identity.
pub const DEPS_PREFIX: &str = "/opt/pyship";
pub const IMAGE_VENV: &str = "/opt/pyship/venv";
pub const IMAGE_LOCK: &str = "/opt/pyship/requirements.lock";

/// Directory holding all published images of a project.
pub fn images_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(OUTPUT_DIR).join("images")
}

/// Directory of one published image.
pub fn image_dir(project_dir: &Path, name: &str) -> PathBuf {
    images_dir(project_dir).join(name)
}

/// Join an absolute in-image path onto a rootfs.
pub fn in_rootfs(rootfs: &Path, path: &str) -> PathBuf {
    rootfs.join(path.trim_start_matches('/'))
}

/// `path` made absolute against the current directory, with `.` components
/// dropped.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(path)
    };
    Ok(joined.components().collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBase {
    /// Pin from the recipe.
    pub requested: String,
    /// Full version reported by the interpreter.
    pub version: String,
    pub interpreter: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLayer {
    pub key: String,
    /// In-image path of the virtual environment.
    pub venv: String,
    /// In-image path of the frozen lock.
    pub lock: String,
    /// SHA256 of the frozen installed set.
    pub lock_digest: String,
    /// Requirements as written in the manifest.
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTree {
    pub digest: String,
    pub files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Tcp => write!(f, "{}/tcp", self.port),
        }
    }
}

/// Everything `pyship run` needs, plus provenance.
///
/// Holds no timestamps: identical inputs produce an identical manifest and
/// therefore an identical `image_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    /// SHA256 of the manifest with this field empty.
    pub image_id: String,
    pub name: String,
    pub base: ResolvedBase,
    pub workdir: String,
    /// Native packages installed on the build host before the dependencies.
    pub system_packages: Vec<String>,
    pub dependencies: DependencyLayer,
    pub source: SourceTree,
    pub user: Identity,
    pub exposed_ports: Vec<ExposedPort>,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub required_env: Vec<EnvRequirement>,
    pub pass_env: Vec<String>,
    pub stages: Vec<StageRecord>,
}

impl ImageManifest {
    /// Fill in `image_id` from the rest of the content.
    ///
    /// Stage records are provenance and stay out of the id: a build that
    /// reused a cached layer yields the same image as one that built it.
    pub fn seal(mut self) -> Result<Self> {
        let stages = std::mem::take(&mut self.stages);
        self.image_id = String::new();
        let canonical = serde_json::to_vec(&self)?;
        self.image_id = format!("sha256:{}", cache::hash_bytes(&canonical));
        self.stages = stages;
        Ok(self)
    }

    pub fn load(image_dir: &Path) -> Result<Self> {
        let path = image_dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Corrupted image manifest at {}", path.display()))
    }

    /// Load a published image by name, or fail with `ImageNotFound`.
    pub fn load_published(project_dir: &Path, name: &str) -> Result<(PathBuf, Self)> {
        let dir = image_dir(project_dir, name);
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(BuildError::ImageNotFound {
                name: name.to_string(),
            }
            .into());
        }
        let manifest = Self::load(&dir)?;
        Ok((dir, manifest))
    }

    /// Workdir path on the host for an image stored at `image_dir`.
    pub fn host_workdir(&self, image_dir: &Path) -> PathBuf {
        in_rootfs(&image_dir.join(ROOTFS_DIR), &self.workdir)
    }

    /// Virtual environment path on the host for an image stored at `image_dir`.
    pub fn host_venv(&self, image_dir: &Path) -> PathBuf {
        in_rootfs(&image_dir.join(ROOTFS_DIR), &self.dependencies.venv)
    }

    /// Check the image still carries the dependency set it was built with.
    pub fn verify_dependencies(&self, image_dir: &Path) -> Result<()> {
        let rootfs = image_dir.join(ROOTFS_DIR);
        let lock_path = in_rootfs(&rootfs, &self.dependencies.lock);
        let lock = fs::read(&lock_path)
            .with_context(|| format!("Image lock {} is missing", lock_path.display()))?;
        if cache::hash_bytes(&lock) != self.dependencies.lock_digest {
            anyhow::bail!("image lock {} does not match the manifest", lock_path.display());
        }
        let bin = self.host_venv(image_dir).join("bin");
        if !bin.is_dir() {
            anyhow::bail!("image environment {} is missing", bin.display());
        }
        Ok(())
    }

    pub fn print(&self) {
        println!("Image {} ({})", self.name, self.image_id);
        println!(
            "  base:         python {} ({}, pinned {})",
            self.base.version,
            self.base.interpreter.display(),
            self.base.requested
        );
        println!("  workdir:      {}", self.workdir);
        if !self.system_packages.is_empty() {
            println!("  system:       {}", self.system_packages.join(" "));
        }
        println!(
            "  dependencies: {} requirement(s), layer {}",
            self.dependencies.requirements.len(),
            short(&self.dependencies.key)
        );
        println!("  venv:         {}", self.dependencies.venv);
        println!("  lock digest:  {}", short(&self.dependencies.lock_digest));
        println!(
            "  source:       {} file(s), digest {}",
            self.source.files,
            short(&self.source.digest)
        );
        println!(
            "  user:         {} ({}:{})",
            self.user.name, self.user.uid, self.user.gid
        );
        for port in &self.exposed_ports {
            println!("  expose:       {}", port);
        }
        println!("  entrypoint:   {}", self.entrypoint.join(" "));
        println!("  stages:");
        for record in &self.stages {
            println!(
                "    {:<13} {:?}  {}",
                record.stage.name(),
                record.outcome,
                record.detail
            );
        }
    }
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}

/// An image under construction.
///
/// Dropping it without calling [`Staging::publish`] removes the staging
/// directory.
pub struct Staging {
    dir: PathBuf,
    target: PathBuf,
    published: bool,
}

impl Staging {
    /// Create a fresh staging directory for `name`.
    pub fn create(project_dir: &Path, name: &str) -> Result<Self> {
        let images = images_dir(project_dir);
        let dir = images.join(format!(".{}.partial", name));
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        fs::create_dir_all(dir.join(ROOTFS_DIR))
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            target: images.join(name),
            published: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join(ROOTFS_DIR)
    }

    /// Where the rootfs will live once published.
    pub fn published_rootfs(&self) -> PathBuf {
        self.target.join(ROOTFS_DIR)
    }

    /// Write the manifest and move the image into place, replacing any
    /// previous image of the same name.
    pub fn publish(mut self, manifest: &ImageManifest) -> Result<PathBuf> {
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.dir.join(MANIFEST_FILE))?;

        if self.target.exists() {
            fs::remove_dir_all(&self.target).with_context(|| {
                format!("Failed to replace previous image {}", self.target.display())
            })?;
        }
        fs::rename(&self.dir, &self.target).with_context(|| {
            format!("Failed to publish image to {}", self.target.display())
        })?;
        self.published = true;
        Ok(self.target.clone())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// Assemble the manifest from a recipe and the stage outputs.
pub fn assemble(
    config: &BuildConfig,
    base: ResolvedBase,
    dependencies: DependencyLayer,
    source: SourceTree,
    user: Identity,
    port: ExposedPort,
    stages: Vec<StageRecord>,
) -> Result<ImageManifest> {
    ImageManifest {
        schema_version: SCHEMA_VERSION,
        image_id: String::new(),
        name: config.name.clone(),
        base,
        workdir: config.workdir.clone(),
        system_packages: config.system.packages.clone(),
        dependencies,
        source,
        user,
        exposed_ports: vec![port],
        env: config.runtime_env().to_map(),
        entrypoint: config.launch.entrypoint.clone(),
        required_env: config.launch.required_env.clone(),
        pass_env: config.launch.pass_env.clone(),
        stages,
    }
    .seal()
}
