//! Show command - displays information.

use anyhow::Result;
use std::path::Path;

use crate::config::BuildConfig;
use crate::image::ImageManifest;
use crate::stage;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show effective configuration
    Config,
    /// Show the ordered stage plan
    Plan,
    /// Show a published image manifest
    Image { name: String },
}

/// Execute the show command.
pub fn cmd_show(project_dir: &Path, target: ShowTarget, config: &BuildConfig) -> Result<()> {
    match target {
        ShowTarget::Config => {
            config.print();
            if let Err(e) = config.validate() {
                println!("\n  [WARN] {:#}", e);
            }
        }
        ShowTarget::Plan => stage::print_plan(),
        ShowTarget::Image { name } => {
            let (dir, manifest) = ImageManifest::load_published(project_dir, &name)?;
            manifest.print();
            println!("  path:         {}", dir.display());
        }
    }
    Ok(())
}
