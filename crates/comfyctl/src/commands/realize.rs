use std::fmt::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use comfyctl_cache::{Cache, default_engine_home};
use comfyctl_git::GitCache;
use comfyctl_realize::RealizeSettings;
use comfyctl_spec::{ResolvedLock, VersionSpec};

use crate::commands::{ExitStatus, existing_spec_path};
use crate::printer::Printer;

pub(crate) struct RealizeOptions {
    pub(crate) target: Option<PathBuf>,
    pub(crate) models_dir: Option<PathBuf>,
    pub(crate) wheels_dir: Option<PathBuf>,
    pub(crate) offline: bool,
    pub(crate) dry_run: bool,
}

/// Resolve the spec and materialize its engine home.
pub(crate) async fn realize(
    version_id: &str,
    specs_dir: &Path,
    cache: &Cache,
    args: RealizeOptions,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let path = existing_spec_path(specs_dir, version_id)?;
    let spec = VersionSpec::load(&path)?;

    let git = GitCache::new(cache.clone());
    let lock = comfyctl_spec::resolve(&spec, &git, args.offline).await?;

    let target = args
        .target
        .clone()
        .unwrap_or_else(|| default_engine_home(&lock.version_id));
    print_plan(&lock, &target, &args, &mut printer)?;

    if args.dry_run {
        writeln!(printer, "Dry run: no changes made")?;
        return Ok(ExitStatus::Success);
    }

    let lock_path = lock.persist(cache)?;
    let settings = RealizeSettings {
        target: Some(target),
        models_dir: args.models_dir,
        wheels_dir: args.wheels_dir,
        offline: args.offline,
        no_overwrite: false,
    };
    let env = comfyctl_realize::realize(&lock, cache, &settings).await?;

    writeln!(printer, "Version ready")?;
    writeln!(printer, "  resolved_lock: {}", lock_path.display())?;
    writeln!(printer, "  COMFY_HOME:    {}", env.engine_home.display())?;
    writeln!(printer, "  MODELS_DIR:    {}", env.models_dir.display())?;
    Ok(ExitStatus::Success)
}

fn print_plan(
    lock: &ResolvedLock,
    target: &Path,
    args: &RealizeOptions,
    printer: &mut Printer,
) -> Result<()> {
    writeln!(printer, "Realization plan:")?;
    writeln!(printer, "  version_id:   {}", lock.version_id)?;
    writeln!(printer, "  target:       {}", target.display())?;
    writeln!(printer, "  offline:      {}", lock.options.offline)?;
    writeln!(printer, "  comfy.repo:   {}", lock.comfy.repo)?;
    writeln!(printer, "  comfy.commit: {}", lock.comfy.commit)?;
    if let Some(models_dir) = &args.models_dir {
        writeln!(printer, "  models_dir:   {}", models_dir.display())?;
    }
    if let Some(wheels_dir) = &args.wheels_dir {
        writeln!(printer, "  wheels_dir:   {}", wheels_dir.display())?;
    }
    if !lock.custom_nodes.is_empty() {
        writeln!(printer, "  custom_nodes:")?;
        for node in &lock.custom_nodes {
            writeln!(printer, "    - {} (commit: {})", node.name, node.commit)?;
        }
    }
    if !lock.models.is_empty() {
        writeln!(printer, "  models:")?;
        for model in &lock.models {
            writeln!(printer, "    - {} -> {}", model.name, model.target_path)?;
        }
    }
    Ok(())
}
