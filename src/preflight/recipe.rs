//! Recipe and project tree checks.

use std::path::Path;

use crate::config::BuildConfig;
use crate::requirements::Manifest;

use super::types::CheckResult;

/// Ports below this need privileges the execution identity never has.
const FIRST_UNPRIVILEGED_PORT: u16 = 1024;

/// Check the recipe and the files it points at.
pub fn check_recipe(project_dir: &Path, config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = vec![check_valid(config)];
    results.extend(check_manifest(project_dir, config));
    results.push(check_entrypoint(project_dir, config));
    results.push(check_port(config));
    results
}

fn check_valid(config: &BuildConfig) -> CheckResult {
    match config.validate() {
        Ok(()) => CheckResult::pass_with("recipe", &config.name),
        Err(e) => CheckResult::fail("recipe", &format!("{:#}", e)),
    }
}

/// Manifest presence, then pinning of every requirement.
fn check_manifest(project_dir: &Path, config: &BuildConfig) -> Vec<CheckResult> {
    let rel = &config.dependencies.manifest;
    let path = project_dir.join(rel);
    if !path.is_file() {
        return vec![CheckResult::fail(
            "dependency manifest",
            &format!("{} not found", rel.display()),
        )];
    }

    let manifest = match Manifest::load(&path) {
        Ok(m) => m,
        Err(e) => return vec![CheckResult::fail("dependency manifest", &format!("{:#}", e))],
    };
    let mut results = vec![CheckResult::pass_with(
        "dependency manifest",
        &format!(
            "{} ({} requirement(s))",
            rel.display(),
            manifest.requirements.len()
        ),
    )];

    let unpinned: Vec<String> = manifest.unpinned().map(|r| r.to_string()).collect();
    if unpinned.is_empty() {
        results.push(CheckResult::pass("requirements pinned"));
    } else {
        results.push(CheckResult::warn(
            "requirements pinned",
            &format!(
                "not pinned with '==': {}. Builds may not be reproducible.",
                unpinned.join(", ")
            ),
        ));
    }
    results
}

/// The first script-looking argument of the entrypoint must be in the tree.
fn check_entrypoint(project_dir: &Path, config: &BuildConfig) -> CheckResult {
    let script = config
        .launch
        .entrypoint
        .iter()
        .skip(1)
        .find(|arg| arg.ends_with(".py") && !arg.starts_with('-'));

    match script {
        Some(script) if project_dir.join(script).is_file() => {
            CheckResult::pass_with("entrypoint", script)
        }
        Some(script) => CheckResult::fail(
            "entrypoint",
            &format!("{} not found in the project tree", script),
        ),
        None => CheckResult::skip(
            "entrypoint",
            &format!("'{}' is not a script invocation", config.launch.entrypoint.join(" ")),
        ),
    }
}

fn check_port(config: &BuildConfig) -> CheckResult {
    let port = config.network.port;
    if port < FIRST_UNPRIVILEGED_PORT {
        CheckResult::fail(
            "exposed port",
            &format!(
                "{} is privileged; user '{}' cannot bind it",
                port, config.user.name
            ),
        )
    } else {
        CheckResult::pass_with("exposed port", &format!("{}/tcp", port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;
    use std::fs;
    use tempfile::TempDir;

    fn pinned() -> BuildConfig {
        let mut config = BuildConfig::default();
        config.base.python = "3.11".into();
        config
    }

    fn status(results: &[CheckResult], name: &str) -> CheckStatus {
        results
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap_or_else(|| panic!("no check named {}", name))
    }

    #[test]
    fn complete_project_passes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "foo==1.0.0\n").unwrap();
        fs::write(dir.path().join("main.py"), "").unwrap();

        let results = check_recipe(dir.path(), &pinned());
        assert!(results.iter().all(|c| c.status == CheckStatus::Pass), "{:?}", results);
    }

    #[test]
    fn unpinned_requirement_warns() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "foo>=1.0\n").unwrap();

        let results = check_recipe(dir.path(), &pinned());
        assert_eq!(status(&results, "requirements pinned"), CheckStatus::Warn);
        assert_eq!(status(&results, "entrypoint"), CheckStatus::Fail);
    }

    #[test]
    fn privileged_port_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = pinned();
        config.network.port = 80;
        let results = check_recipe(dir.path(), &config);
        assert_eq!(status(&results, "exposed port"), CheckStatus::Fail);
        assert_eq!(status(&results, "dependency manifest"), CheckStatus::Fail);
    }

    #[test]
    fn unset_pin_fails_recipe() {
        let dir = TempDir::new().unwrap();
        let results = check_recipe(dir.path(), &BuildConfig::default());
        assert_eq!(status(&results, "recipe"), CheckStatus::Fail);
    }

    #[test]
    fn non_script_entrypoint_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = pinned();
        config.launch.entrypoint = vec!["gunicorn".into(), "app:wsgi".into()];
        let results = check_recipe(dir.path(), &config);
        assert_eq!(status(&results, "entrypoint"), CheckStatus::Skip);
    }
}
