//! Build stages for producing a runnable, least-privilege image.
//!
//! The build is a fixed, non-branching sequence of stages. Each stage is a
//! plain value; the runner walks [`Stage::ALL`] in order and hands each one to
//! its handler.
//!
//! ```text
//! Stage (DATA)                 →     Runner (LOGIC)
//! ─────────────────                  ─────────────────────────────
//! Base, Workdir, System,             for stage in Stage::ALL {
//! Dependencies, Source,                check_precondition(ctx, stage)?;
//! Identity, Privilege, Network         execute_stage(ctx, stage).await?;
//!                                    }
//! ```
//!
//! There is no optional ordering. The dependency stage must precede the
//! source stage, otherwise every source edit would invalidate the dependency
//! layer.

pub mod base;
pub mod context;
pub mod dependencies;
pub mod identity;
pub mod network;
pub mod privilege;
pub mod runner;
pub mod source;
pub mod system;
pub mod workdir;

pub use context::BuildContext;
pub use runner::run_stages;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Build stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    /// Resolve the pinned interpreter.
    Base = 1,
    /// Create the fixed working directory.
    Workdir = 2,
    /// Native build packages, then purge configured package indexes.
    System = 3,
    /// Manifest copy and dependency layer.
    Dependencies = 4,
    /// Full application tree.
    Source = 5,
    /// Non-root account and ownership transfer.
    Identity = 6,
    /// Fix the identity every later process runs as.
    Privilege = 7,
    /// Advisory port metadata.
    Network = 8,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Base,
        Stage::Workdir,
        Stage::System,
        Stage::Dependencies,
        Stage::Source,
        Stage::Identity,
        Stage::Privilege,
        Stage::Network,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Base => "base",
            Stage::Workdir => "workdir",
            Stage::System => "system",
            Stage::Dependencies => "dependencies",
            Stage::Source => "source",
            Stage::Identity => "identity",
            Stage::Privilege => "privilege",
            Stage::Network => "network",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Stage::Base => "Select base runtime",
            Stage::Workdir => "Establish working directory",
            Stage::System => "Install system build dependencies",
            Stage::Dependencies => "Install dependency manifest",
            Stage::Source => "Copy application file tree",
            Stage::Identity => "Provision execution identity",
            Stage::Privilege => "Drop privilege",
            Stage::Network => "Declare network contract",
        }
    }

    /// Position in [`Stage::ALL`].
    pub fn index(&self) -> usize {
        *self as usize - 1
    }

    /// Stages that must have completed before this one starts.
    pub fn predecessors(&self) -> &'static [Stage] {
        &Stage::ALL[..self.index()]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    /// Reused a valid cached layer.
    Cached,
    /// Nothing to do for this recipe.
    Skipped,
}

/// Record of one completed stage, stored in the image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: Outcome,
    pub detail: String,
}

impl StageRecord {
    pub fn done(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            outcome: Outcome::Done,
            detail: detail.into(),
        }
    }

    pub fn cached(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            outcome: Outcome::Cached,
            detail: detail.into(),
        }
    }

    pub fn skipped(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            outcome: Outcome::Skipped,
            detail: detail.into(),
        }
    }
}

/// Print the ordered stage plan.
pub fn print_plan() {
    println!("Build plan:");
    for stage in Stage::ALL {
        println!("  {}. {:<13} {}", stage.index() + 1, stage.name(), stage.description());
    }
    println!("  9. {:<13} {}", "launch", "Start entrypoint (pyship run)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_size() {
        assert_eq!(std::mem::size_of::<Stage>(), 1, "Stage should be repr(u8)");
    }

    #[test]
    fn all_is_sorted_and_complete() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn dependencies_before_source() {
        assert!(Stage::Dependencies < Stage::Source);
        assert!(Stage::Source.predecessors().contains(&Stage::Dependencies));
        assert!(!Stage::Dependencies.predecessors().contains(&Stage::Source));
    }

    #[test]
    fn identity_before_privilege_before_network() {
        assert!(Stage::Identity < Stage::Privilege);
        assert!(Stage::Privilege < Stage::Network);
    }

    #[test]
    fn base_has_no_predecessors() {
        assert!(Stage::Base.predecessors().is_empty());
        assert_eq!(Stage::Network.predecessors().len(), 7);
    }

    #[test]
    fn serializes_as_name() {
        assert_eq!(serde_json::to_string(&Stage::Dependencies).unwrap(), "\"dependencies\"");
    }
}
