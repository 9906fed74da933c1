//! Shared test utilities for pyship tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use pyship::config::BuildConfig;

/// Stand-in interpreter: reports 3.11.9, creates venvs by copying itself,
/// and "installs" a manifest by recording it. Any requirement pinned to
/// 999.999.999 is unsatisfiable. A script argument is run with `sh`, with
/// the interpreter's own path in `FAKE_PYTHON_EXE`.
const FAKE_PYTHON: &str = r#"#!/bin/sh
here=$(cd "$(dirname "$0")" && pwd)
state="$here/../installed.txt"
if [ "$1" = "-c" ]; then
    echo 3.11.9
    exit 0
fi
if [ -f "$1" ]; then
    script="$1"
    shift
    FAKE_PYTHON_EXE="$0" exec /bin/sh "$script" "$@"
fi
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
    mkdir -p "$3/bin" && cp "$0" "$3/bin/python" && exit 0
    exit 1
fi
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
    case "$3" in
        install)
            shift 3
            req=""
            while [ $# -gt 0 ]; do
                if [ "$1" = "-r" ]; then req="$2"; shift; fi
                shift
            done
            [ -z "$req" ] && exit 0
            if grep -q '999.999.999' "$req"; then
                echo "ERROR: No matching distribution found for $(grep '999.999.999' "$req" | head -n 1)" >&2
                exit 1
            fi
            grep -v '^#' "$req" | grep -v '^[[:space:]]*$' > "$state"
            exit 0
            ;;
        freeze)
            echo "pip==24.0"
            [ -f "$state" ] && cat "$state"
            exit 0
            ;;
    esac
fi
echo "unsupported: $*" >&2
exit 2
"#;

/// Uid the test images run as: ourselves, or an arbitrary one under root.
pub fn test_uid() -> u32 {
    // SAFETY: geteuid(2) cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        4242
    } else {
        euid
    }
}

/// Gid of the test identity. A non-root caller can only hand files to its
/// own group.
pub fn test_gid() -> u32 {
    // SAFETY: geteuid(2) and getegid(2) cannot fail.
    unsafe {
        if libc::geteuid() == 0 {
            4242
        } else {
            libc::getegid()
        }
    }
}

/// Sandboxed project, layer cache and stub interpreter.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Project tree being packaged
    pub project: PathBuf,
    /// Dependency layer cache root
    pub cache: PathBuf,
    /// Stub interpreter
    pub python: PathBuf,
}

impl TestEnv {
    /// Create a project holding `requirements` and a trivial `main.py`.
    pub fn new(requirements: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        // The image identity must be able to traverse into the sandbox.
        fs::set_permissions(temp_dir.path(), fs::Permissions::from_mode(0o755))
            .expect("Failed to open up temp dir");

        let project = temp_dir.path().join("project");
        let cache = temp_dir.path().join("cache");
        let tools = temp_dir.path().join("tools");
        for dir in [&project, &cache, &tools] {
            fs::create_dir_all(dir).expect("Failed to create sandbox dir");
        }

        let python = tools.join("python3.11");
        fs::write(&python, FAKE_PYTHON).expect("Failed to write stub interpreter");
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755))
            .expect("Failed to make stub interpreter executable");

        fs::write(project.join("requirements.txt"), requirements)
            .expect("Failed to write requirements");
        fs::write(project.join("main.py"), "print('hello')\n").expect("Failed to write main.py");

        Self {
            _temp_dir: temp_dir,
            project,
            cache,
            python,
        }
    }

    /// Write `pyship.toml` with the given launch command and extra TOML.
    pub fn write_recipe(&self, entrypoint: &[&str], extra_launch: &str) {
        let entrypoint: Vec<String> = entrypoint.iter().map(|a| format!("{:?}", a)).collect();
        let recipe = format!(
            r#"name = "bot"
cache_dir = "{cache}"

[base]
python = "3.11"
interpreter = "{python}"

[user]
name = "botuser"
uid = {uid}
gid = {gid}

[launch]
entrypoint = [{entrypoint}]
runtime_dirs = ["out"]
{extra_launch}
"#,
            cache = self.cache.display(),
            python = self.python.display(),
            uid = test_uid(),
            gid = test_gid(),
            entrypoint = entrypoint.join(", "),
            extra_launch = extra_launch,
        );
        fs::write(self.project.join("pyship.toml"), recipe).expect("Failed to write recipe");
    }

    /// Move the layer cache under a directory only the builder can enter.
    /// Call before `write_recipe`.
    pub fn use_private_cache(&mut self) {
        let private = self._temp_dir.path().join("private");
        fs::create_dir_all(&private).expect("Failed to create private dir");
        fs::set_permissions(&private, fs::Permissions::from_mode(0o700))
            .expect("Failed to restrict private dir");
        self.cache = private.join("cache");
        fs::create_dir_all(&self.cache).expect("Failed to create private cache");
    }

    /// Load the recipe without picking up the process environment.
    pub fn config(&self) -> BuildConfig {
        BuildConfig::load_with_vars(&self.project, None, &HashMap::new())
            .expect("Failed to load recipe")
    }

    /// Rewrite a project file.
    pub fn write(&self, rel: &str, content: &str) {
        fs::write(self.project.join(rel), content).expect("Failed to write project file");
    }

    /// Complete layers in the cache.
    pub fn complete_layers(&self) -> Vec<PathBuf> {
        let layers = self.cache.join("layers");
        let Ok(entries) = fs::read_dir(&layers) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join(pyship::cache::LAYER_COMPLETE_MARKER).exists())
            .collect()
    }
}

/// Read a file the entrypoint wrote into the image workdir.
pub fn read_record(image_dir: &Path, workdir: &str, name: &str) -> String {
    let path = image_dir
        .join("rootfs")
        .join(workdir.trim_start_matches('/'))
        .join("out")
        .join(name);
    fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read record {}: {}", path.display(), e))
}
