use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;

use comfyctl_cache::Cache;

use crate::commands::ExitStatus;

mod commands;
mod handler;
mod logging;
mod printer;

#[derive(Parser)]
#[command(name = "comfyctl", author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Do not print any output.
    #[arg(global = true, long, short, conflicts_with = "verbose")]
    quiet: bool,

    /// Use verbose output.
    #[arg(global = true, long, short, conflicts_with = "quiet")]
    verbose: bool,

    /// Path to the cache directory.
    #[arg(global = true, long)]
    cache_dir: Option<PathBuf>,

    /// Directory holding version specs (`<id>.json`).
    #[arg(global = true, long, default_value = "versions")]
    specs_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage reproducible engine versions.
    Version {
        #[command(subcommand)]
        command: VersionCommand,
    },
}

#[derive(Subcommand)]
enum VersionCommand {
    /// Create a skeleton spec for a new version.
    Create(CreateArgs),
    /// Resolve refs to commits and save the resolved lock.
    Resolve(ResolveArgs),
    /// Validate a spec without touching the network.
    Validate(VersionIdArg),
    /// Materialize the environment for a version.
    Realize(RealizeArgs),
    /// Realize, then run the engine interactively.
    RunUi(RunUiArgs),
    /// Run one workflow request through the handler pipeline.
    RunHandler(RunHandlerArgs),
    /// Remove a version's engine home.
    Delete(DeleteArgs),
    /// Copy a spec under a new version id.
    Clone(CloneArgs),
}

#[derive(Args)]
struct VersionIdArg {
    /// Version identifier (loads `<specs_dir>/<id>.json`).
    version_id: String,
}

#[derive(Args)]
struct CreateArgs {
    version_id: String,

    /// Engine repository URL recorded in the new spec.
    #[arg(long)]
    repo: Option<String>,
}

#[derive(Args)]
struct ResolveArgs {
    version_id: String,

    /// Skip network operations where possible.
    #[arg(long)]
    offline: bool,
}

#[derive(Args)]
struct RealizeArgs {
    version_id: String,

    /// Explicit engine home path.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Override the models directory.
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Directory with wheel files for offline installs.
    #[arg(long)]
    wheels_dir: Option<PathBuf>,

    /// Skip git/pip operations where possible.
    #[arg(long)]
    offline: bool,

    /// Show the plan without making changes.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct RunUiArgs {
    version_id: String,

    /// Address the engine binds.
    #[arg(long, default_value = "127.0.0.1")]
    listen: String,

    /// Port the engine binds.
    #[arg(long, default_value_t = 8188)]
    port: u16,

    #[arg(long)]
    offline: bool,
}

#[derive(Args)]
struct RunHandlerArgs {
    version_id: String,

    /// Path to the workflow JSON (graph).
    #[arg(long)]
    workflow: PathBuf,

    /// How to return the result.
    #[arg(long, default_value = "base64", value_parser = ["base64", "gcs"])]
    output: String,

    /// Write base64 output to a file instead of stdout.
    #[arg(long)]
    out_file: Option<PathBuf>,

    /// Target bucket for gcs output.
    #[arg(long, env = "GCS_BUCKET")]
    gcs_bucket: Option<String>,

    /// Object prefix inside the bucket.
    #[arg(long, env = "GCS_PREFIX")]
    gcs_prefix: Option<String>,

    /// Override the models directory.
    #[arg(long)]
    models_dir: Option<PathBuf>,

    #[arg(long)]
    offline: bool,
}

#[derive(Args)]
struct DeleteArgs {
    version_id: String,

    /// Explicit engine home path to remove.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Also remove the resolved-lock document.
    #[arg(long)]
    locks: bool,
}

#[derive(Args)]
struct CloneArgs {
    /// Existing version identifier.
    source_id: String,
    /// New version identifier.
    new_id: String,
}

async fn inner() -> Result<ExitStatus> {
    let cli = Cli::parse();

    logging::setup_logging(if cli.verbose {
        logging::Level::Verbose
    } else {
        logging::Level::Default
    })?;

    let printer = if cli.quiet {
        printer::Printer::Quiet
    } else if cli.verbose {
        printer::Printer::Verbose
    } else {
        printer::Printer::Default
    };

    let cache = Cache::from_settings(cli.cache_dir)?;

    match cli.command {
        Commands::Version { command } => match command {
            VersionCommand::Create(args) => {
                commands::create(&args.version_id, args.repo.as_deref(), &cli.specs_dir, printer)
                    .await
            }
            VersionCommand::Resolve(args) => {
                commands::resolve(&args.version_id, &cli.specs_dir, &cache, args.offline, printer)
                    .await
            }
            VersionCommand::Validate(args) => {
                commands::validate(&args.version_id, &cli.specs_dir, printer).await
            }
            VersionCommand::Realize(args) => {
                commands::realize(
                    &args.version_id,
                    &cli.specs_dir,
                    &cache,
                    commands::RealizeOptions {
                        target: args.target,
                        models_dir: args.models_dir,
                        wheels_dir: args.wheels_dir,
                        offline: args.offline,
                        dry_run: args.dry_run,
                    },
                    printer,
                )
                .await
            }
            VersionCommand::RunUi(args) => {
                commands::run_ui(
                    &args.version_id,
                    &cli.specs_dir,
                    &cache,
                    &args.listen,
                    args.port,
                    args.offline,
                    printer,
                )
                .await
            }
            VersionCommand::RunHandler(args) => {
                commands::run_handler(
                    &args.version_id,
                    &cli.specs_dir,
                    &cache,
                    commands::RunHandlerOptions {
                        workflow: args.workflow,
                        output: args.output,
                        out_file: args.out_file,
                        gcs_bucket: args.gcs_bucket,
                        gcs_prefix: args.gcs_prefix,
                        models_dir: args.models_dir,
                        offline: args.offline,
                    },
                    printer,
                )
                .await
            }
            VersionCommand::Delete(args) => {
                commands::delete(&args.version_id, args.target, args.locks, &cache, printer).await
            }
            VersionCommand::Clone(args) => {
                commands::clone(&args.source_id, &args.new_id, &cli.specs_dir, printer).await
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match inner().await {
        Ok(status) => status.into(),
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                let mut causes = err.chain();
                eprintln!(
                    "{}: {}",
                    "error".red().bold(),
                    causes.next().map(ToString::to_string).unwrap_or_default()
                );
                for err in causes {
                    eprintln!("  {}: {}", "Caused by".red().bold(), err);
                }
            }
            ExitStatus::Failure.into()
        }
    }
}
