use std::fmt::Write;
use std::path::Path;

use anyhow::Result;

use comfyctl_spec::VersionSpec;

use crate::commands::{ExitStatus, existing_spec_path};
use crate::printer::Printer;

/// Parse and validate a spec without touching the network.
pub(crate) async fn validate(
    version_id: &str,
    specs_dir: &Path,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let path = existing_spec_path(specs_dir, version_id)?;
    let spec = VersionSpec::load(&path)?;

    writeln!(printer, "OK: {}", path.display())?;
    writeln!(printer, "  version_id:   {}", spec.version_id)?;
    writeln!(printer, "  comfy.repo:   {}", spec.comfy.repo)?;
    writeln!(printer, "  custom_nodes: {}", spec.custom_nodes.len())?;
    writeln!(printer, "  models:       {}", spec.models.len())?;
    Ok(ExitStatus::Success)
}
