//! Sequential stage runner.
//!
//! Runs every stage of [`Stage::ALL`] in order. The first failure aborts the
//! rest; nothing catches a stage error and carries on.

use anyhow::{bail, Context, Result};
use tracing::Instrument;

use super::{base, dependencies, identity, network, privilege, source, system, workdir};
use super::{BuildContext, Stage, StageRecord};
use crate::timing::Timer;

/// Run all stages against `ctx`.
pub async fn run_stages(ctx: &mut BuildContext) -> Result<()> {
    for stage in Stage::ALL {
        run_stage(ctx, stage).await?;
    }
    Ok(())
}

/// Run a single stage after checking its precondition.
pub async fn run_stage(ctx: &mut BuildContext, stage: Stage) -> Result<()> {
    check_precondition(ctx, stage)?;

    let span = tracing::info_span!("stage", stage = stage.name());
    let timer = Timer::start(stage.description());

    let record = execute_stage(ctx, stage)
        .instrument(span)
        .await
        .with_context(|| format!("stage '{}' failed", stage))?;

    timer.finish();
    ctx.completed.push(record);
    Ok(())
}

/// Every earlier stage must have completed, and this one must not have.
pub fn check_precondition(ctx: &BuildContext, stage: Stage) -> Result<()> {
    if ctx.has_completed(stage) {
        bail!("stage '{}' already ran", stage);
    }
    let missing: Vec<&str> = stage
        .predecessors()
        .iter()
        .filter(|s| !ctx.has_completed(**s))
        .map(|s| s.name())
        .collect();
    if !missing.is_empty() {
        bail!(
            "stage '{}' cannot start before: {}",
            stage,
            missing.join(", ")
        );
    }
    Ok(())
}

async fn execute_stage(ctx: &mut BuildContext, stage: Stage) -> Result<StageRecord> {
    match stage {
        Stage::Base => base::select_base(ctx).await,
        Stage::Workdir => workdir::establish_workdir(ctx),
        Stage::System => system::install_system_packages(ctx).await,
        Stage::Dependencies => dependencies::install_dependencies(ctx).await,
        Stage::Source => source::copy_source_tree(ctx),
        Stage::Identity => identity::provision_identity(ctx),
        Stage::Privilege => privilege::drop_privilege(ctx),
        Stage::Network => network::declare_port(ctx),
    }
}
