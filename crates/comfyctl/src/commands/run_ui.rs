use std::fmt::Write;
use std::path::Path;

use anyhow::Result;

use comfyctl_cache::Cache;
use comfyctl_git::GitCache;
use comfyctl_process::Command;
use comfyctl_realize::RealizeSettings;
use comfyctl_spec::VersionSpec;

use crate::commands::{ExitStatus, existing_spec_path};
use crate::printer::Printer;

/// Realize a version, then run the engine interactively in the foreground.
///
/// Unlike the handler path this keeps auto-launch enabled and binds whatever
/// address the caller asked for. The engine's exit code is propagated.
pub(crate) async fn run_ui(
    version_id: &str,
    specs_dir: &Path,
    cache: &Cache,
    listen: &str,
    port: u16,
    offline: bool,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let path = existing_spec_path(specs_dir, version_id)?;
    let spec = VersionSpec::load(&path)?;

    let git = GitCache::new(cache.clone());
    let lock = comfyctl_spec::resolve(&spec, &git, offline).await?;
    lock.persist(cache)?;

    let settings = RealizeSettings {
        offline,
        ..RealizeSettings::default()
    };
    let env = comfyctl_realize::realize(&lock, cache, &settings).await?;

    writeln!(
        printer,
        "Starting engine from {} on {listen}:{port}",
        env.engine_home.display()
    )?;
    let mut command = Command::new(&env.interpreter)
        .arg(env.engine_home.join("main.py"))
        .args(["--listen", listen, "--port"])
        .arg(port.to_string())
        .current_dir(&env.engine_home)
        .env("COMFY_HOME", &env.engine_home)
        .env("MODELS_DIR", &env.models_dir);
    for (key, value) in &lock.env {
        command = command.env(key, value);
    }

    let child = command.spawn_logged("engine")?;
    let status = child.wait().await?;
    match status.code() {
        Some(0) => Ok(ExitStatus::Success),
        Some(code) => Ok(ExitStatus::Engine(code)),
        None => Ok(ExitStatus::Engine(1)),
    }
}
