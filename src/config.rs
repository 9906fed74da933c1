//! Configuration management for pyship.
//!
//! The build recipe lives in `pyship.toml` at the project root. Every field
//! has a default except the pinned interpreter version. Environment variables
//! (after `.env` has been loaded into the process) override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Recipe file name looked up in the project directory.
pub const CONFIG_FILE: &str = "pyship.toml";

/// Directory (relative to the project) where images are published.
pub const OUTPUT_DIR: &str = ".pyship";

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_WORKDIR: &str = "/app";
pub const DEFAULT_MANIFEST: &str = "requirements.txt";
pub const DEFAULT_USER: &str = "appuser";
pub const DEFAULT_UID: u32 = 1000;

/// Suppress compiled bytecode so the image stays minimal and deterministic.
pub const ENV_NO_BYTECODE: &str = "PYTHONDONTWRITEBYTECODE";
/// Force unbuffered stdout/stderr so log lines leave the process immediately.
pub const ENV_UNBUFFERED: &str = "PYTHONUNBUFFERED";

/// Complete build recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Image name (directory under `.pyship/images/`).
    pub name: String,
    pub base: BaseConfig,
    /// Absolute working directory inside the image.
    pub workdir: String,
    pub system: SystemConfig,
    pub dependencies: DependencyConfig,
    pub user: UserConfig,
    pub network: NetworkConfig,
    pub launch: LaunchConfig,
    /// Environment applied to every build command and to the entrypoint.
    pub env: BTreeMap<String, String>,
    /// Dependency layer cache location (default: `~/.cache/pyship`).
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseConfig {
    /// Pinned interpreter version, e.g. "3.11" or "3.11.9".
    pub python: String,
    /// Explicit interpreter path. Skips the PATH search when set.
    pub interpreter: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    /// Native build packages (compilers, headers).
    pub packages: Vec<String>,
    /// Index refresh command, run once before installing.
    pub refresh: Vec<String>,
    /// Install command; package names are appended.
    pub install: Vec<String>,
    /// Host directories whose contents are purged after installation, e.g.
    /// `/var/lib/apt/lists` on a disposable build host. Empty by default:
    /// packages land on the build host, so purging acts on the host too.
    pub purge: Vec<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            refresh: vec!["apt-get".into(), "update".into()],
            install: vec![
                "apt-get".into(),
                "install".into(),
                "-y".into(),
                "--no-install-recommends".into(),
            ],
            purge: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependencyConfig {
    /// Manifest path relative to the project.
    pub manifest: PathBuf,
    /// Installer requirement. `None` upgrades pip to the newest release.
    pub installer: Option<String>,
    /// Timeout for each installer invocation.
    pub timeout_secs: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            installer: None,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    pub name: String,
    pub uid: u32,
    /// Defaults to the uid.
    pub gid: Option<u32>,
    /// Defaults to the working directory.
    pub home: Option<String>,
    pub shell: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_USER.into(),
            uid: DEFAULT_UID,
            gid: None,
            home: None,
            shell: "/usr/sbin/nologin".into(),
        }
    }
}

impl UserConfig {
    pub fn gid(&self) -> u32 {
        self.gid.unwrap_or(self.uid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// Command started as the foreground process.
    pub entrypoint: Vec<String>,
    /// Variables that must be set in the launching environment. An inner
    /// list is satisfied by any one of its names.
    pub required_env: Vec<EnvRequirement>,
    /// Variables copied from the launching environment when present.
    pub pass_env: Vec<String>,
    /// Directories created inside the workdir and owned by the identity.
    pub runtime_dirs: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            entrypoint: vec!["python".into(), "main.py".into()],
            required_env: Vec::new(),
            pass_env: Vec::new(),
            runtime_dirs: Vec::new(),
        }
    }
}

/// A launch-time environment precondition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvRequirement {
    /// This variable must be set.
    One(String),
    /// At least one of these must be set, e.g. `["TELEGRAM_BOT_TOKEN", "BOT_TOKEN"]`.
    AnyOf(Vec<String>),
}

impl EnvRequirement {
    pub fn names(&self) -> &[String] {
        match self {
            EnvRequirement::One(name) => std::slice::from_ref(name),
            EnvRequirement::AnyOf(names) => names,
        }
    }

    /// True when any of the names has a non-empty value in `vars`.
    pub fn is_satisfied(&self, vars: &HashMap<String, String>) -> bool {
        self.names()
            .iter()
            .any(|name| vars.get(name).is_some_and(|v| !v.is_empty()))
    }
}

impl std::fmt::Display for EnvRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.names().join(" or "))
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: "app".into(),
            base: BaseConfig::default(),
            workdir: DEFAULT_WORKDIR.into(),
            system: SystemConfig::default(),
            dependencies: DependencyConfig::default(),
            user: UserConfig::default(),
            network: NetworkConfig::default(),
            launch: LaunchConfig::default(),
            env: BTreeMap::new(),
            cache_dir: None,
        }
    }
}

impl BuildConfig {
    /// Load the recipe for a project, applying process environment overrides.
    ///
    /// `file` overrides the default `<project>/pyship.toml`; an explicit file
    /// must exist, the default one is optional.
    pub fn load(project_dir: &Path, file: Option<&Path>) -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::load_with_vars(project_dir, file, &vars)
    }

    /// Same as [`BuildConfig::load`] with an explicit variable map.
    pub fn load_with_vars(
        project_dir: &Path,
        file: Option<&Path>,
        vars: &HashMap<String, String>,
    ) -> Result<Self> {
        let path = match file {
            Some(f) if f.is_absolute() => f.to_path_buf(),
            Some(f) => project_dir.join(f),
            None => project_dir.join(CONFIG_FILE),
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else if file.is_some() {
            return Err(BuildError::config(format!("{} does not exist", path.display())).into());
        } else {
            Self::default()
        };

        config.apply_overrides(vars)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BuildError::config(e.to_string()).into())
    }

    fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        if let Some(v) = vars.get("PYSHIP_PYTHON") {
            self.base.python = v.clone();
        }
        if let Some(v) = vars.get("PYSHIP_PORT") {
            self.network.port = v
                .parse()
                .map_err(|_| BuildError::config(format!("PYSHIP_PORT is not a port: {}", v)))?;
        }
        if let Some(v) = vars.get("PYSHIP_USER") {
            self.user.name = v.clone();
        }
        if let Some(v) = vars.get("PYSHIP_WORKDIR") {
            self.workdir = v.clone();
        }
        if let Some(v) = vars.get("PYSHIP_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject recipes that would break the reproducibility or privilege
    /// guarantees.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| -> Result<()> { Err(BuildError::config(reason).into()) };

        if !is_valid_image_name(&self.name) {
            return fail(format!("invalid image name '{}'", self.name));
        }
        if let Err(reason) = crate::stage::base::PythonPin::parse(&self.base.python) {
            return fail(reason);
        }
        if let Err(reason) = check_workdir(&self.workdir) {
            return fail(reason);
        }
        if !self.system.packages.is_empty() && self.system.install.is_empty() {
            return fail("system.packages configured but system.install is empty".into());
        }
        if self.dependencies.manifest.is_absolute() {
            return fail("dependencies.manifest must be relative to the project".into());
        }
        if self.dependencies.timeout_secs == 0 {
            return fail("dependencies.timeout_secs must be positive".into());
        }
        if !is_valid_user_name(&self.user.name) {
            return fail(format!("invalid user name '{}'", self.user.name));
        }
        if self.user.uid == 0 || self.user.gid() == 0 {
            return fail("execution identity must not use uid or gid 0".into());
        }
        if self.network.port == 0 {
            return fail("network.port must be non-zero".into());
        }
        if self.launch.entrypoint.is_empty() || self.launch.entrypoint[0].is_empty() {
            return fail("launch.entrypoint must name a program".into());
        }
        for dir in &self.launch.runtime_dirs {
            if dir.is_empty() || dir.starts_with('/') || dir.split('/').any(|c| c == "..") {
                return fail(format!("runtime dir '{}' must be relative to the workdir", dir));
            }
        }
        if self.launch.required_env.iter().any(|r| r.names().is_empty()) {
            return fail("launch.required_env contains an empty group".into());
        }
        let required = self.launch.required_env.iter().flat_map(|r| r.names());
        for key in self.env.keys().chain(required).chain(&self.launch.pass_env) {
            if key.is_empty() || key.contains('=') {
                return fail(format!("invalid environment variable name '{}'", key));
            }
        }
        Ok(())
    }

    /// Dependency layer cache root.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("pyship")
        })
    }

    /// Home directory of the execution identity.
    pub fn user_home(&self) -> String {
        self.user.home.clone().unwrap_or_else(|| self.workdir.clone())
    }

    /// Immutable environment for every stage and the entrypoint.
    pub fn runtime_env(&self) -> RuntimeEnv {
        RuntimeEnv::from_overrides(&self.env)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  name:        {}", self.name);
        println!("  python:      {}", display_or_unset(&self.base.python));
        if let Some(interpreter) = &self.base.interpreter {
            println!("  interpreter: {}", interpreter.display());
        }
        println!("  workdir:     {}", self.workdir);
        if self.system.packages.is_empty() {
            println!("  system:      (none)");
        } else {
            println!("  system:      {}", self.system.packages.join(" "));
        }
        println!("  manifest:    {}", self.dependencies.manifest.display());
        match &self.dependencies.installer {
            Some(pin) => println!("  installer:   {}", pin),
            None => println!("  installer:   pip (upgraded)"),
        }
        println!(
            "  user:        {} ({}:{})",
            self.user.name,
            self.user.uid,
            self.user.gid()
        );
        println!("  port:        {}/tcp", self.network.port);
        println!("  entrypoint:  {}", self.launch.entrypoint.join(" "));
        println!("  cache:       {}", self.cache_root().display());
        println!("  env:");
        for (key, value) in self.runtime_env().iter() {
            println!("    {}={}", key, value);
        }
    }
}

/// In-image trees the workdir must neither contain nor sit inside: the
/// account database and the dependency environment stay out of the
/// identity's hands.
const RESERVED_PATHS: [&str; 2] = ["/etc", crate::image::DEPS_PREFIX];

fn check_workdir(workdir: &str) -> std::result::Result<(), String> {
    if !workdir.starts_with('/') {
        return Err(format!("workdir must be an absolute path, got '{}'", workdir));
    }
    let components: Vec<&str> = workdir.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == "..") {
        return Err(format!("workdir must not contain '.' or '..', got '{}'", workdir));
    }
    if components.is_empty() {
        return Err("workdir cannot be the filesystem root".into());
    }
    for reserved in RESERVED_PATHS {
        let reserved: Vec<&str> = reserved.split('/').filter(|c| !c.is_empty()).collect();
        if components.starts_with(&reserved) || reserved.starts_with(&components) {
            return Err(format!(
                "workdir '{}' overlaps reserved image path /{}",
                workdir,
                reserved.join("/")
            ));
        }
    }
    Ok(())
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(unset)"
    } else {
        value
    }
}

fn is_valid_image_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Same rules `useradd` applies by default: `[a-z_][a-z0-9_-]*`, at most 32.
fn is_valid_user_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 32
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
}

/// Environment applied to every build-stage command and the entrypoint.
///
/// Always contains [`ENV_NO_BYTECODE`] and [`ENV_UNBUFFERED`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    vars: BTreeMap<String, String>,
}

impl RuntimeEnv {
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(ENV_NO_BYTECODE.to_string(), "1".to_string());
        vars.insert(ENV_UNBUFFERED.to_string(), "1".to_string());
        for (key, value) in overrides {
            vars.insert(key.clone(), value.clone());
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when compiled bytecode is suppressed.
    pub fn suppresses_bytecode(&self) -> bool {
        self.get(ENV_NO_BYTECODE).is_some_and(|v| !v.is_empty() && v != "0")
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinned() -> BuildConfig {
        BuildConfig {
            base: BaseConfig {
                python: "3.11".into(),
                interpreter: None,
            },
            ..BuildConfig::default()
        }
    }

    #[test]
    fn defaults_match_reference_manifest() {
        let config = BuildConfig::default();
        assert_eq!(config.workdir, "/app");
        assert_eq!(config.network.port, 8000);
        assert_eq!(config.dependencies.manifest, PathBuf::from("requirements.txt"));
        assert_eq!(config.launch.entrypoint, vec!["python", "main.py"]);
        assert_eq!(config.user.gid(), config.user.uid);
    }

    #[test]
    fn runtime_env_always_has_python_flags() {
        let env = BuildConfig::default().runtime_env();
        assert_eq!(env.get(ENV_NO_BYTECODE), Some("1"));
        assert_eq!(env.get(ENV_UNBUFFERED), Some("1"));
        assert!(env.suppresses_bytecode());
    }

    #[test]
    fn runtime_env_overrides_win() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ENV_NO_BYTECODE.to_string(), "0".to_string());
        overrides.insert("APP_MODE".to_string(), "prod".to_string());
        let env = RuntimeEnv::from_overrides(&overrides);
        assert!(!env.suppresses_bytecode());
        assert_eq!(env.get(ENV_UNBUFFERED), Some("1"));
        assert_eq!(env.get("APP_MODE"), Some("prod"));
    }

    #[test]
    fn parses_full_recipe() {
        let config = BuildConfig::from_toml(
            r#"
            name = "bot"
            workdir = "/srv/bot"

            [base]
            python = "3.11.9"

            [system]
            packages = ["gcc"]

            [user]
            name = "botuser"
            uid = 1500

            [launch]
            entrypoint = ["python", "main.py"]
            required_env = ["BOT_TOKEN"]
            runtime_dirs = ["logs", "data"]

            [env]
            APP_MODE = "prod"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "bot");
        assert_eq!(config.base.python, "3.11.9");
        assert_eq!(config.system.packages, vec!["gcc"]);
        assert_eq!(config.system.install[0], "apt-get");
        assert_eq!(config.user.uid, 1500);
        assert_eq!(
            config.launch.required_env,
            vec![EnvRequirement::One("BOT_TOKEN".into())]
        );
        assert_eq!(config.env.get("APP_MODE").map(String::as_str), Some("prod"));
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = BuildConfig::from_toml("[base]\npyhton = \"3.11\"\n").unwrap_err();
        assert!(BuildError::find(&err).is_some());
    }

    #[test]
    fn floating_python_is_rejected() {
        for version in ["", "latest", "3", "3.x"] {
            let mut config = pinned();
            config.base.python = version.into();
            assert!(config.validate().is_err(), "accepted '{}'", version);
        }
    }

    #[test]
    fn root_identity_is_rejected() {
        let mut config = pinned();
        config.user.uid = 0;
        assert!(config.validate().is_err());

        let mut config = pinned();
        config.user.gid = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_workdir_is_rejected() {
        let mut config = pinned();
        config.workdir = "app".into();
        assert!(config.validate().is_err());
        config.workdir = "/".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn workdir_must_not_cover_reserved_paths() {
        for workdir in ["/.", "//", "/app/./x", "/etc", "/etc/app", "/opt", "/opt/pyship/venv"] {
            let mut config = pinned();
            config.workdir = workdir.into();
            assert!(config.validate().is_err(), "accepted '{}'", workdir);
        }
        for workdir in ["/app", "/srv/bot/", "/opt/app", "/etcetera"] {
            let mut config = pinned();
            config.workdir = workdir.into();
            config.validate().unwrap();
        }
    }

    #[test]
    fn required_env_accepts_any_of_groups() {
        let config = BuildConfig::from_toml(
            r#"
            [base]
            python = "3.11"

            [launch]
            required_env = [["TELEGRAM_BOT_TOKEN", "BOT_TOKEN"], "DB_URL"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let required = &config.launch.required_env;
        assert_eq!(
            required[0],
            EnvRequirement::AnyOf(vec!["TELEGRAM_BOT_TOKEN".into(), "BOT_TOKEN".into()])
        );
        assert_eq!(required[1], EnvRequirement::One("DB_URL".into()));
        assert_eq!(required[0].to_string(), "TELEGRAM_BOT_TOKEN or BOT_TOKEN");

        let mut vars = HashMap::new();
        assert!(!required[0].is_satisfied(&vars));
        vars.insert("BOT_TOKEN".to_string(), "t".to_string());
        assert!(required[0].is_satisfied(&vars));
    }

    #[test]
    fn empty_env_group_is_rejected() {
        let mut config = pinned();
        config.launch.required_env = vec![EnvRequirement::AnyOf(Vec::new())];
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_purge_is_opt_in() {
        assert!(BuildConfig::default().system.purge.is_empty());
    }

    #[test]
    fn user_name_rules() {
        assert!(is_valid_user_name("appuser"));
        assert!(is_valid_user_name("_svc-1"));
        assert!(!is_valid_user_name("AppUser"));
        assert!(!is_valid_user_name("1app"));
        assert!(!is_valid_user_name(""));
    }

    #[test]
    fn overrides_from_vars() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = HashMap::new();
        vars.insert("PYSHIP_PYTHON".to_string(), "3.12".to_string());
        vars.insert("PYSHIP_PORT".to_string(), "9000".to_string());

        let config = BuildConfig::load_with_vars(dir.path(), None, &vars).unwrap();
        assert_eq!(config.base.python, "3.12");
        assert_eq!(config.network.port, 9000);
    }

    #[test]
    fn bad_port_override_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = HashMap::new();
        vars.insert("PYSHIP_PORT".to_string(), "http".to_string());
        assert!(BuildConfig::load_with_vars(dir.path(), None, &vars).is_err());
    }

    #[test]
    fn explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildConfig::load_with_vars(
            dir.path(),
            Some(Path::new("missing.toml")),
            &HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(BuildError::find(&err).unwrap().kind(), "InvalidConfig");
    }
}
