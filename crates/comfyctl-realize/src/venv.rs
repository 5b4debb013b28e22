use std::path::{Path, PathBuf};

use tracing::{debug, info};

use comfyctl_process::Command;

use crate::RealizeError;

/// The interpreter path inside an engine home's venv.
pub fn venv_python(engine_home: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        engine_home.join(".venv").join("Scripts").join("python.exe")
    }
    #[cfg(not(windows))]
    {
        engine_home.join(".venv").join("bin").join("python")
    }
}

pub(crate) fn is_executable(path: &Path) -> bool {
    use rustix::fs::{Access, access};
    path.is_file() && access(path, Access::EXEC_OK).is_ok()
}

/// The platform interpreter: `python3`, then `python`, on PATH.
pub fn system_python() -> Result<PathBuf, RealizeError> {
    ["python3", "python"]
        .iter()
        .find_map(|candidate| which::which(candidate).ok())
        .ok_or(RealizeError::NoInterpreter)
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Select (and if needed provision) the interpreter for an engine home.
///
/// `COMFY_USE_SYSTEM_PYTHON` short-circuits to the platform interpreter.
/// Otherwise an existing venv interpreter is reused; a missing one is created
/// with `python -m venv`, using copies unless `COMFY_VENV_MODE=symlinks`.
pub async fn ensure_interpreter(engine_home: &Path) -> Result<PathBuf, RealizeError> {
    if env_truthy("COMFY_USE_SYSTEM_PYTHON") {
        let python = system_python()?;
        info!("using system interpreter {}", python.display());
        return Ok(python);
    }

    let python = venv_python(engine_home);
    if is_executable(&python) {
        debug!("reusing venv interpreter {}", python.display());
        return Ok(python);
    }

    let base = system_python()?;
    let mode = match std::env::var("COMFY_VENV_MODE").as_deref() {
        Ok("symlinks") => "--symlinks",
        _ => "--copies",
    };
    info!(
        "creating venv at {} with {}",
        engine_home.join(".venv").display(),
        base.display()
    );
    let output = Command::new(&base)
        .args(["-m", "venv", mode])
        .arg(engine_home.join(".venv"))
        .output()
        .await;
    if !output.success() {
        return Err(RealizeError::Venv {
            stderr: if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            },
        });
    }
    if !is_executable(&python) {
        return Err(RealizeError::Venv {
            stderr: format!("venv created but {} is not executable", python.display()),
        });
    }
    Ok(python)
}

/// `pip install` through a specific interpreter.
///
/// A wheelhouse switches pip to `--no-index --find-links`, which is what makes
/// offline installs possible.
pub async fn pip_install(
    interpreter: &Path,
    stage: &str,
    args: &[String],
    wheels_dir: Option<&Path>,
) -> Result<(), RealizeError> {
    let mut command = Command::new(interpreter).args(["-m", "pip", "install"]);
    if let Some(wheels_dir) = wheels_dir {
        command = command.arg("--no-index").arg("--find-links").arg(wheels_dir);
    }
    command = command.args(args.iter().cloned());

    debug!("pip install ({stage}): {}", args.join(" "));
    let output = command.output().await;
    if !output.success() {
        return Err(RealizeError::Pip {
            stage: stage.to_string(),
            stderr: if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            },
        });
    }
    Ok(())
}

/// Python snippet printing the subset of argv distributions that are not
/// importable metadata-wise, one per line.
const MISSING_DISTRIBUTIONS_PROBE: &str = r#"
import importlib.metadata as m
import sys
installed = set()
for dist in m.distributions():
    name = dist.metadata["Name"]
    if name:
        installed.add(name.lower().replace("_", "-").replace(".", "-"))
for wanted in sys.argv[1:]:
    if wanted.lower().replace("_", "-").replace(".", "-") not in installed:
        print(wanted)
"#;

/// Ask `interpreter` which of `packages` (normalized names) are missing.
pub async fn missing_distributions(
    interpreter: &Path,
    packages: &[String],
) -> Result<Vec<String>, RealizeError> {
    if packages.is_empty() {
        return Ok(Vec::new());
    }
    let output = Command::new(interpreter)
        .arg("-c")
        .arg(MISSING_DISTRIBUTIONS_PROBE)
        .args(packages.iter().cloned())
        .output()
        .await;
    if !output.success() {
        return Err(RealizeError::Pip {
            stage: "query-distributions".to_string(),
            stderr: output.stderr,
        });
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_distributions_against_system_python() {
        let Ok(python) = system_python() else {
            // No python on this machine; nothing to verify.
            return;
        };
        let packages = vec!["definitely-not-a-real-package-xyz".to_string()];
        let missing = missing_distributions(&python, &packages).await.unwrap();
        assert_eq!(missing, packages);
    }

    #[test]
    fn venv_python_layout() {
        let home = Path::new("/builds/comfy-x");
        assert!(venv_python(home).starts_with("/builds/comfy-x/.venv"));
    }
}
