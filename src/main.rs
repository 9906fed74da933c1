//! pyship - build-and-bootstrap sequencer for Python network services.
//!
//! Turns a project tree into a runnable image directory through a fixed
//! sequence of stages, then launches its entrypoint as a non-root identity:
//! - pinned interpreter, dependency layer cached on the manifest alone
//! - application tree copied after dependencies
//! - dedicated account owning the workdir, privilege dropped before launch

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pyship::commands;
use pyship::config::BuildConfig;
use pyship::error::exit_code_for;

#[derive(Parser)]
#[command(name = "pyship")]
#[command(about = "Build and launch least-privilege images of Python services")]
#[command(
    after_help = "QUICK START:\n  pyship preflight  Check the recipe and host\n  pyship build      Build and publish the image\n  pyship run        Launch the entrypoint\n  pyship clean      Remove images"
)]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Recipe file (default: <project>/pyship.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage and publish the image
    Build {
        /// Image name (default: recipe name)
        #[arg(long)]
        name: Option<String>,
        /// Rebuild the dependency layer even if cached
        #[arg(long)]
        no_cache: bool,
    },

    /// Launch a published image's entrypoint in the foreground
    Run {
        /// Image name (default: recipe name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks (verify recipe and host before a build)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Remove build outputs (default: images)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show effective configuration
    Config,
    /// Show the ordered stage plan
    Plan,
    /// Show a published image
    Image {
        /// Image name (default: recipe name)
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Remove published images of this project
    Images,
    /// Remove cached dependency layers
    Cache,
    /// Remove images and cached layers
    All,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PYSHIP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Dispatch a command. Returns the process exit code.
async fn run(cli: Cli) -> Result<i32> {
    let project = cli.project;
    let config = BuildConfig::load(&project, cli.config.as_deref())?;

    match cli.command {
        Commands::Build { name, no_cache } => {
            let options = commands::build::BuildOptions { name, no_cache };
            commands::cmd_build(&project, config, &options).await?;
        }

        Commands::Run { name } => {
            let name = name.unwrap_or_else(|| config.name.clone());
            return commands::cmd_run(&project, &name).await;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Plan => commands::show::ShowTarget::Plan,
                ShowTarget::Image { name } => commands::show::ShowTarget::Image {
                    name: name.unwrap_or_else(|| config.name.clone()),
                },
            };
            commands::cmd_show(&project, show_target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&project, &config, strict).await?;
        }

        Commands::Clean { what } => {
            let clean_target = match what {
                None | Some(CleanTarget::Images) => commands::clean::CleanTarget::Images,
                Some(CleanTarget::Cache) => commands::clean::CleanTarget::Cache,
                Some(CleanTarget::All) => commands::clean::CleanTarget::All,
            };
            commands::cmd_clean(&project, clean_target, &config)?;
        }
    }

    Ok(0)
}

#[tokio::main]
async fn main() {
    // Load .env if present
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}
