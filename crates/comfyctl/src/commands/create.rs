use std::fmt::Write;
use std::path::Path;

use anyhow::{Result, bail};
use serde_json::json;

use crate::commands::{ExitStatus, spec_path_for};
use crate::printer::Printer;

/// The upstream engine repository used when none is given.
const DEFAULT_ENGINE_REPO: &str = "https://github.com/comfyanonymous/ComfyUI";

/// Write a skeleton spec for a new version.
pub(crate) async fn create(
    version_id: &str,
    repo: Option<&str>,
    specs_dir: &Path,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let path = spec_path_for(specs_dir, version_id)?;
    if path.exists() {
        bail!("spec already exists: {}", path.display());
    }

    let spec = json!({
        "schema_version": 2,
        "version_id": version_id.trim(),
        "comfy": {
            "repo": repo.unwrap_or(DEFAULT_ENGINE_REPO),
        },
        "custom_nodes": [],
        "models": [],
        "env": {},
        "options": {},
    });
    fs_err::create_dir_all(specs_dir)?;
    let mut text = serde_json::to_string_pretty(&spec)?;
    text.push('\n');
    fs_err::write(&path, text)?;

    writeln!(printer, "Created {}", path.display())?;
    writeln!(
        printer,
        "Pin it with `comfyctl version resolve {}`",
        version_id.trim()
    )?;
    Ok(ExitStatus::Success)
}
