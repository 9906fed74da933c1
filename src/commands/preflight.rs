//! Preflight command - runs preflight checks.

use anyhow::Result;
use std::path::Path;

use crate::config::BuildConfig;
use crate::preflight;

/// Execute the preflight command.
pub async fn cmd_preflight(project_dir: &Path, config: &BuildConfig, strict: bool) -> Result<()> {
    // SAFETY: geteuid(2) has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if strict {
        preflight::run_preflight_or_fail(project_dir, config, euid).await?;
    } else {
        let report = preflight::run_preflight(project_dir, config, euid).await;
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to exit non-zero.");
        }
    }
    Ok(())
}
