//! Host capability checks.

use crate::config::BuildConfig;
use crate::process;
use crate::stage::base;

use super::types::CheckResult;

/// Check the host can run the build for `config` as effective uid `euid`.
pub async fn check_host(config: &BuildConfig, euid: u32) -> Vec<CheckResult> {
    let mut results = vec![check_interpreter(config).await];
    results.push(check_package_manager(config));
    results.push(check_ownership(config, euid));
    results
}

async fn check_interpreter(config: &BuildConfig) -> CheckResult {
    let name = "python interpreter";
    match base::resolve(
        &config.base.python,
        config.base.interpreter.as_deref(),
        &config.runtime_env(),
    )
    .await
    {
        Ok(base) => CheckResult::pass_with(
            name,
            &format!("{} ({})", base.version, base.interpreter.display()),
        ),
        Err(e) => CheckResult::fail(name, &format!("{:#}", e)),
    }
}

fn check_package_manager(config: &BuildConfig) -> CheckResult {
    let name = "system package manager";
    let system = &config.system;
    if system.packages.is_empty() {
        return CheckResult::skip(name, "no system packages requested");
    }
    let Some(tool) = system.install.first() else {
        return CheckResult::fail(name, "system.install is empty");
    };
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(name, &path.display().to_string()),
        None => CheckResult::fail(
            name,
            &format!(
                "'{}' not found; needed to install {}",
                tool,
                system.packages.join(" ")
            ),
        ),
    }
}

/// Handing the workdir to the identity needs root, or being that identity.
fn check_ownership(config: &BuildConfig, euid: u32) -> CheckResult {
    let name = "ownership transfer";
    if euid == 0 {
        CheckResult::pass_with(name, "running as root")
    } else if euid == config.user.uid {
        CheckResult::pass_with(name, &format!("already uid {}", euid))
    } else {
        CheckResult::warn(
            name,
            &format!(
                "uid {} cannot chown to {} (uid {}); build as root or as that user",
                euid, config.user.name, config.user.uid
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;

    #[test]
    fn ownership_depends_on_euid() {
        let config = BuildConfig::default();
        assert_eq!(check_ownership(&config, 0).status, CheckStatus::Pass);
        assert_eq!(check_ownership(&config, config.user.uid).status, CheckStatus::Pass);
        assert_eq!(check_ownership(&config, 4321).status, CheckStatus::Warn);
    }

    #[test]
    fn package_manager_only_when_packages_requested() {
        let mut config = BuildConfig::default();
        assert_eq!(check_package_manager(&config).status, CheckStatus::Skip);

        config.system.packages = vec!["gcc".into()];
        config.system.install = vec!["no-such-package-tool-xyz".into()];
        assert_eq!(check_package_manager(&config).status, CheckStatus::Fail);

        config.system.install = vec!["sh".into()];
        assert_eq!(check_package_manager(&config).status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn missing_interpreter_fails() {
        let mut config = BuildConfig::default();
        config.base.python = "3.11".into();
        config.base.interpreter = Some("/nonexistent/python3.11".into());
        assert_eq!(check_interpreter(&config).await.status, CheckStatus::Fail);
    }
}
