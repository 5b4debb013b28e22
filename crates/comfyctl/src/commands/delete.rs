use std::fmt::Write;
use std::path::PathBuf;

use anyhow::Result;

use comfyctl_cache::{Cache, default_engine_home};
use comfyctl_spec::ResolvedLock;

use crate::commands::ExitStatus;
use crate::printer::Printer;

/// Remove a version's engine home, and optionally its resolved lock.
///
/// This is the only deletion path for version directories.
pub(crate) async fn delete(
    version_id: &str,
    target: Option<PathBuf>,
    with_locks: bool,
    cache: &Cache,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let engine_home = target.unwrap_or_else(|| default_engine_home(version_id));
    if engine_home.exists() {
        fs_err::remove_dir_all(&engine_home)?;
        writeln!(printer, "Removed {}", engine_home.display())?;
    } else {
        writeln!(printer, "Nothing at {}", engine_home.display())?;
    }

    if with_locks {
        let lock_path = ResolvedLock::path_for(cache, version_id);
        if lock_path.exists() {
            fs_err::remove_file(&lock_path)?;
            writeln!(printer, "Removed {}", lock_path.display())?;
        }
    }

    Ok(ExitStatus::Success)
}
