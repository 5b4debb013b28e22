use std::fmt::Write;
use std::path::Path;

use anyhow::Result;

use comfyctl_cache::Cache;
use comfyctl_git::GitCache;
use comfyctl_spec::VersionSpec;

use crate::commands::{ExitStatus, existing_spec_path};
use crate::printer::Printer;

/// Pin every mutable reference and persist the resolved lock.
pub(crate) async fn resolve(
    version_id: &str,
    specs_dir: &Path,
    cache: &Cache,
    offline: bool,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let path = existing_spec_path(specs_dir, version_id)?;
    let spec = VersionSpec::load(&path)?;

    let git = GitCache::new(cache.clone());
    let lock = comfyctl_spec::resolve(&spec, &git, offline).await?;
    let lock_path = lock.persist(cache)?;

    writeln!(printer, "Resolved {}", spec.version_id)?;
    writeln!(printer, "  offline:  {}", lock.options.offline)?;
    writeln!(printer, "  saved_to: {}", lock_path.display())?;
    Ok(ExitStatus::Success)
}
