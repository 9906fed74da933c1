//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Run the stage sequence and publish an image
//! - `run` - Launch a published image's entrypoint
//! - `clean` - Remove images and cached layers
//! - `show` - Display configuration, the plan, or an image
//! - `preflight` - Run preflight checks

pub mod build;
pub mod clean;
mod preflight;
mod run;
pub mod show;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use run::cmd_run;
pub use show::cmd_show;
