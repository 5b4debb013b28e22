use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, bail};

pub(crate) use clone::clone;
pub(crate) use create::create;
pub(crate) use delete::delete;
pub(crate) use realize::{RealizeOptions, realize};
pub(crate) use resolve::resolve;
pub(crate) use run_handler::{RunHandlerOptions, run_handler};
pub(crate) use run_ui::run_ui;
pub(crate) use validate::validate;

mod clone;
mod create;
mod delete;
mod realize;
mod resolve;
mod run_handler;
mod run_ui;
mod validate;

#[derive(Debug, Copy, Clone)]
pub(crate) enum ExitStatus {
    /// The command succeeded.
    Success,
    /// The command failed due to an error in the user input or spec.
    Failure,
    /// The engine subprocess failed; its exit code is propagated.
    Engine(i32),
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::from(0),
            ExitStatus::Failure => ExitCode::from(2),
            ExitStatus::Engine(code) => {
                let code = u8::try_from(code.rem_euclid(256)).unwrap_or(1);
                ExitCode::from(if code == 0 { 1 } else { code })
            }
        }
    }
}

/// The spec document location for a version: `<specs_dir>/<id>.json`.
pub(crate) fn spec_path_for(specs_dir: &Path, version_id: &str) -> Result<PathBuf> {
    let version_id = version_id.trim();
    if version_id.is_empty() {
        bail!("empty version id");
    }
    Ok(specs_dir.join(format!("{version_id}.json")))
}

/// Like [`spec_path_for`], but the file must already exist.
pub(crate) fn existing_spec_path(specs_dir: &Path, version_id: &str) -> Result<PathBuf> {
    let path = spec_path_for(specs_dir, version_id)?;
    if !path.is_file() {
        bail!(
            "spec file not found for version '{version_id}': {}",
            path.display()
        );
    }
    Ok(path)
}
