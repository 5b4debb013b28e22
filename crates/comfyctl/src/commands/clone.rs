use std::fmt::Write;
use std::path::Path;

use anyhow::{Result, bail};

use comfyctl_spec::VersionSpec;

use crate::commands::{ExitStatus, existing_spec_path, spec_path_for};
use crate::printer::Printer;

/// Copy an existing spec under a new version id.
pub(crate) async fn clone(
    source_id: &str,
    new_id: &str,
    specs_dir: &Path,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let source_path = existing_spec_path(specs_dir, source_id)?;
    let target_path = spec_path_for(specs_dir, new_id)?;
    if target_path.exists() {
        bail!("spec already exists: {}", target_path.display());
    }

    let mut spec = VersionSpec::load(&source_path)?;
    spec.version_id = new_id.trim().to_string();
    let mut text = serde_json::to_string_pretty(&spec)?;
    text.push('\n');
    fs_err::write(&target_path, text)?;

    writeln!(
        printer,
        "Cloned {} -> {}",
        source_path.display(),
        target_path.display()
    )?;
    Ok(ExitStatus::Success)
}
