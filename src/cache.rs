//! Content hashing and the dependency layer cache.
//!
//! Uses SHA256 hashes of actual content, not mtimes, so touching a file
//! without changing it never invalidates a layer.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Marker written last into a layer; a layer without it is not valid.
pub const LAYER_COMPLETE_MARKER: &str = ".complete";

/// Hex SHA256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Deterministic digest of a directory tree.
///
/// Covers relative paths, file types, permission bits, file contents and
/// symlink targets. Entries are visited in sorted order, and anything under
/// one of `exclude` (absolute paths) is skipped.
pub fn hash_tree(root: &Path, exclude: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|x| e.path().starts_with(x)));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("walkdir yielded a path outside the root")?;
        let meta = entry.path().symlink_metadata()?;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        if meta.file_type().is_symlink() {
            hasher.update(b"L");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else if meta.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            hasher.update((meta.permissions().mode() & 0o7777).to_le_bytes());
            let content = fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }
        hasher.update([0]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Inputs that determine the content of a dependency layer.
///
/// Application source is deliberately absent: editing it must never
/// invalidate the layer.
#[derive(Debug, Clone)]
pub struct LayerKey<'a> {
    pub python_version: &'a str,
    pub installer: &'a str,
    pub system_packages: &'a [String],
    pub bytecode: bool,
    /// Manifest file and every file it includes, in include order.
    pub manifest_files: &'a [(String, Vec<u8>)],
}

impl LayerKey<'_> {
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |name: &str, value: &[u8]| {
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value);
        };
        field("python", self.python_version.as_bytes());
        field("installer", self.installer.as_bytes());
        field("bytecode", if self.bytecode { b"1" } else { b"0" });
        for package in self.system_packages {
            field("system", package.as_bytes());
        }
        for (name, content) in self.manifest_files {
            field("file", name.as_bytes());
            field("content", content);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Content-addressed store of dependency layers.
#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            root: cache_root.join("layers"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layer_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// A layer is valid only once its completion marker names its key.
    pub fn is_complete(&self, key: &str) -> bool {
        read_cached_hash(&self.layer_dir(key).join(LAYER_COMPLETE_MARKER)).as_deref() == Some(key)
    }

    /// Prepare an empty directory for a new layer, discarding any leftovers.
    pub fn begin(&self, key: &str) -> Result<PathBuf> {
        let dir = self.layer_dir(key);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear stale layer {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create layer {}", dir.display()))?;
        Ok(dir)
    }

    /// Mark a layer valid.
    pub fn commit(&self, key: &str) -> Result<()> {
        write_cached_hash(&self.layer_dir(key).join(LAYER_COMPLETE_MARKER), key)
    }

    /// Remove an incomplete layer so nothing half-built is ever reused.
    pub fn discard(&self, key: &str) {
        let dir = self.layer_dir(key);
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(layer = %dir.display(), error = %e, "failed to discard layer");
            }
        }
    }

    /// Remove every layer.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("Failed to remove {}", self.root.display()))?;
        }
        Ok(())
    }
}

/// Read cached hash from a .hash file.
/// Returns None if file doesn't exist.
pub fn read_cached_hash(hash_file: &Path) -> Option<String> {
    if !hash_file.exists() {
        return None;
    }
    match fs::read_to_string(hash_file) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            tracing::warn!(path = %hash_file.display(), error = %e, "failed to read hash file");
            None
        }
    }
}

/// Write hash to a .hash file.
pub fn write_cached_hash(hash_file: &Path, hash: &str) -> Result<()> {
    if let Some(parent) = hash_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(hash_file, hash)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key<'a>(files: &'a [(String, Vec<u8>)], packages: &'a [String]) -> LayerKey<'a> {
        LayerKey {
            python_version: "3.11.9",
            installer: "pip",
            system_packages: packages,
            bytecode: false,
            manifest_files: files,
        }
    }

    #[test]
    fn layer_key_tracks_manifest_content() {
        let a = vec![("requirements.txt".to_string(), b"foo==1.0.0\n".to_vec())];
        let b = vec![("requirements.txt".to_string(), b"foo==1.0.1\n".to_vec())];
        assert_eq!(key(&a, &[]).digest(), key(&a, &[]).digest());
        assert_ne!(key(&a, &[]).digest(), key(&b, &[]).digest());
    }

    #[test]
    fn layer_key_tracks_system_packages_and_runtime() {
        let files = vec![("requirements.txt".to_string(), b"foo==1.0.0\n".to_vec())];
        let gcc = vec!["gcc".to_string()];
        assert_ne!(key(&files, &[]).digest(), key(&files, &gcc).digest());

        let mut other = key(&files, &[]);
        other.python_version = "3.12.1";
        assert_ne!(key(&files, &[]).digest(), other.digest());
    }

    #[test]
    fn tree_hash_is_stable_and_content_sensitive() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        fs::create_dir(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/mod.py"), "x = 1\n").unwrap();

        let first = hash_tree(dir.path(), &[]).unwrap();
        assert_eq!(first, hash_tree(dir.path(), &[]).unwrap());

        fs::write(dir.path().join("pkg/mod.py"), "x = 2\n").unwrap();
        assert_ne!(first, hash_tree(dir.path(), &[]).unwrap());
    }

    #[test]
    fn tree_hash_honours_exclusions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        let before = hash_tree(dir.path(), &[dir.path().join(".pyship")]).unwrap();

        fs::create_dir(dir.path().join(".pyship")).unwrap();
        fs::write(dir.path().join(".pyship/image.json"), "{}").unwrap();
        let after = hash_tree(dir.path(), &[dir.path().join(".pyship")]).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn layer_is_invalid_until_committed() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::new(dir.path());
        let layer = cache.begin("abc").unwrap();
        fs::write(layer.join("requirements.lock"), "foo==1.0.0\n").unwrap();
        assert!(!cache.is_complete("abc"));

        cache.commit("abc").unwrap();
        assert!(cache.is_complete("abc"));

        cache.discard("abc");
        assert!(!cache.layer_dir("abc").exists());
    }

    #[test]
    fn begin_clears_leftovers() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::new(dir.path());
        let layer = cache.begin("abc").unwrap();
        fs::write(layer.join("junk"), "x").unwrap();
        let layer = cache.begin("abc").unwrap();
        assert!(!layer.join("junk").exists());
    }
}
