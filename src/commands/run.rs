//! Run command - launches a published image.

use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;

use crate::launch;

/// Execute the run command. Returns the entrypoint's exit code.
pub async fn cmd_run(project_dir: &Path, name: &str) -> Result<i32> {
    let host_env: HashMap<String, String> = std::env::vars().collect();
    launch::launch(project_dir, name, &host_env).await
}
