//! Preflight checks for a pyship project.
//!
//! Validates the recipe, the project tree and the host before a build.
//! Run with `pyship preflight` to check everything is ready.

mod host;
mod recipe;
mod types;

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::BuildConfig;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks for `config` as effective uid `euid`.
pub async fn run_preflight(project_dir: &Path, config: &BuildConfig, euid: u32) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking recipe...");
    checks.extend(recipe::check_recipe(project_dir, config));

    println!("Checking host...");
    checks.extend(host::check_host(config, euid).await);

    println!();

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub async fn run_preflight_or_fail(project_dir: &Path, config: &BuildConfig, euid: u32) -> Result<()> {
    let report = run_preflight(project_dir, config, euid).await;
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
