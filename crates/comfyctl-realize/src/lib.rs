//! Environment realization: turn a resolved lock into a ready engine home.
//!
//! The order is fixed: engine checkout, venv, engine requirements, plugin
//! clones, plugin requirements, dependency verification, model placement,
//! and finally the readiness marker, which is the commit point. A matching
//! marker short-circuits everything except model placement.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

use comfyctl_cache::{Cache, default_engine_home, default_models_dir};
use comfyctl_fetch::{Checksum, FetchError, Fetcher, ModelSource, publish};
use comfyctl_git::{GitCache, GitError};
use comfyctl_spec::{PreparedMarker, ResolvedLock, ResolvedModel};

pub use model_paths::{render_extra_model_paths, write_extra_model_paths};
pub use requirements::{package_name, read_requirements};
pub use venv::{ensure_interpreter, missing_distributions, pip_install, system_python, venv_python};

mod model_paths;
mod requirements;
mod venv;

#[derive(Debug, Error)]
pub enum RealizeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to create virtual environment: {stderr}")]
    Venv { stderr: String },

    #[error("pip failed during {stage}: {stderr}")]
    Pip { stage: String, stderr: String },

    #[error("plugin dependencies still missing after install: {}", .packages.join(", "))]
    MissingDependencies { packages: Vec<String> },

    #[error("no python interpreter found on PATH")]
    NoInterpreter,

    #[error("offline mode is set, but {0}")]
    Offline(String),

    #[error("resolved lock is inconsistent: {0}")]
    Lock(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Caller-provided knobs for realization.
#[derive(Debug, Clone, Default)]
pub struct RealizeSettings {
    /// Explicit engine home; the conventional per-version path otherwise.
    pub target: Option<PathBuf>,
    /// Explicit models dir.
    pub models_dir: Option<PathBuf>,
    /// Wheelhouse for `--no-index --find-links` installs.
    pub wheels_dir: Option<PathBuf>,
    pub offline: bool,
    /// Refuse to replace checksum-mismatched model files when false.
    pub no_overwrite: bool,
}

/// The realized execution context, passed explicitly downstream.
#[derive(Debug, Clone)]
pub struct RealizedEnv {
    pub engine_home: PathBuf,
    pub models_dir: PathBuf,
    pub interpreter: PathBuf,
}

/// Outcome of a best-effort plugin requirements install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginInstall {
    Installed,
    Unchanged,
    Failed,
}

/// Materialize the engine home described by `lock`.
pub async fn realize(
    lock: &ResolvedLock,
    cache: &Cache,
    settings: &RealizeSettings,
) -> Result<RealizedEnv, RealizeError> {
    let engine_home = settings
        .target
        .clone()
        .unwrap_or_else(|| default_engine_home(&lock.version_id));
    let models_dir = settings
        .models_dir
        .clone()
        .unwrap_or_else(|| default_models_dir(&engine_home));
    fs_err::create_dir_all(&engine_home)?;
    fs_err::create_dir_all(&models_dir)?;

    let offline = settings.offline || lock.options.offline;
    let signature = lock.signature();

    let venv_interpreter = venv::venv_python(&engine_home);
    let fast_path = venv::is_executable(&venv_interpreter)
        && engine_home.join("main.py").is_file()
        && PreparedMarker::load(&engine_home).as_ref() == Some(&signature);

    let interpreter = if fast_path {
        info!(
            "engine home {} already prepared for {}; skipping preparation",
            engine_home.display(),
            lock.version_id
        );
        venv::ensure_interpreter(&engine_home).await?
    } else {
        prepare(lock, cache, settings, &engine_home, offline).await?
    };

    if lock.options.skip_models {
        info!("skip_models set; leaving model placement untouched");
    } else {
        let fetcher = Fetcher::new(cache.clone());
        for model in &lock.models {
            place_model(&fetcher, model, &models_dir, offline, settings.no_overwrite).await?;
        }
    }

    if !fast_path {
        write_extra_model_paths(&engine_home, &models_dir, &lock.models)?;
        // The marker is the commit point: it only lands after everything
        // above has succeeded.
        signature.persist(&engine_home)?;
        info!("engine home {} prepared", engine_home.display());
    }

    Ok(RealizedEnv {
        engine_home,
        models_dir,
        interpreter,
    })
}

/// The full preparation path (steps 3-8): checkout, venv, requirements,
/// plugins, dependency verification.
async fn prepare(
    lock: &ResolvedLock,
    cache: &Cache,
    settings: &RealizeSettings,
    engine_home: &Path,
    offline: bool,
) -> Result<PathBuf, RealizeError> {
    let git = GitCache::new(cache.clone());
    let wheels_dir = settings.wheels_dir.as_deref();

    // Engine checkout.
    if lock.comfy.commit.is_empty() {
        if engine_home.join("main.py").is_file() {
            warn!("engine commit unresolved; keeping the existing checkout as-is");
        } else {
            return Err(RealizeError::Offline(format!(
                "the engine commit is unresolved and no checkout exists at {}",
                engine_home.display()
            )));
        }
    } else {
        let repo_cache = git.ensure_repo_cache(&lock.comfy.repo, offline).await?;
        git.materialize_working_copy(&repo_cache, engine_home, &lock.comfy.commit, offline)
            .await?;
    }

    // Interpreter.
    let interpreter = venv::ensure_interpreter(engine_home).await?;

    // Engine requirements.
    let engine_requirements = engine_home.join("requirements.txt");
    if engine_requirements.is_file() {
        if wheels_dir.is_some() || !offline {
            venv::pip_install(
                &interpreter,
                "engine-requirements",
                &[
                    "-r".to_string(),
                    engine_requirements.display().to_string(),
                ],
                wheels_dir,
            )
            .await?;
        } else {
            warn!("offline without a wheelhouse; skipping engine requirements install");
        }
    }

    // Plugin clones and links.
    let mut plugin_requirements = Vec::new();
    let links_dir = engine_home.join("custom_nodes");
    fs_err::create_dir_all(&links_dir)?;
    for node in &lock.custom_nodes {
        if node.commit.is_empty() {
            warn!("plugin {} is unpinned; skipping", node.name);
            continue;
        }
        let checkout = git.node_checkout_dir(&node.repo, &node.commit)?;
        let repo_cache = git.ensure_repo_cache(&node.repo, offline).await?;
        git.materialize_working_copy(&repo_cache, &checkout, &node.commit, offline)
            .await?;
        replace_symlink(&checkout, &links_dir.join(&node.name))?;

        let requirements = checkout.join("requirements.txt");
        if requirements.is_file() {
            plugin_requirements.push((node.name.clone(), requirements));
        }
    }

    // Best-effort plugin installs; failures surface in the verification pass.
    for (name, requirements) in &plugin_requirements {
        let outcome = if offline && wheels_dir.is_none() {
            PluginInstall::Unchanged
        } else {
            match venv::pip_install(
                &interpreter,
                &format!("plugin {name}"),
                &["-r".to_string(), requirements.display().to_string()],
                wheels_dir,
            )
            .await
            {
                Ok(()) => PluginInstall::Installed,
                Err(err) => {
                    warn!("requirements install for plugin {name} failed: {err}");
                    PluginInstall::Failed
                }
            }
        };
        debug!("plugin {name} requirements: {outcome:?}");
    }

    // Dependency verification with one batched remediation attempt.
    let mut wanted: BTreeSet<String> = BTreeSet::new();
    for (_, requirements) in &plugin_requirements {
        for line in requirements::read_requirements(requirements)? {
            if let Some(name) = requirements::package_name(&line) {
                wanted.insert(name);
            }
        }
    }
    let wanted: Vec<String> = wanted.into_iter().collect();
    let mut missing = venv::missing_distributions(&interpreter, &wanted).await?;
    if !missing.is_empty() && (wheels_dir.is_some() || !offline) {
        warn!(
            "plugin dependencies missing, attempting one batched install: {}",
            missing.join(", ")
        );
        if let Err(err) =
            venv::pip_install(&interpreter, "plugin-remediation", &missing, wheels_dir).await
        {
            warn!("batched install failed: {err}");
        }
        missing = venv::missing_distributions(&interpreter, &missing).await?;
    }
    if !missing.is_empty() {
        return Err(RealizeError::MissingDependencies { packages: missing });
    }

    Ok(interpreter)
}

/// Place (or verify) one model artifact under the models dir.
async fn place_model(
    fetcher: &Fetcher,
    model: &ResolvedModel,
    models_dir: &Path,
    offline: bool,
    no_overwrite: bool,
) -> Result<(), RealizeError> {
    let target = {
        let path = Path::new(&model.target_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            models_dir.join(path)
        }
    };
    let source = ModelSource::parse(&model.source)?;
    let checksum = model
        .checksum
        .as_deref()
        .map(Checksum::from_str)
        .transpose()
        .map_err(|err| RealizeError::Lock(err.to_string()))?;

    if !target.exists() {
        let cached = fetcher
            .ensure_cached(&source, checksum.as_ref(), &model.name, offline, Some(&target))
            .await?;
        let placed = publish(&cached, &target)?;
        debug!("model {}: {placed:?} at {}", model.name, target.display());
        return Ok(());
    }

    let Some(expected) = checksum else {
        debug!("model {} present (unverified)", model.name);
        return Ok(());
    };

    let verdict = {
        let target = target.clone();
        let expected = expected.clone();
        tokio::task::spawn_blocking(move || expected.matches_file(&target))
            .await
            .map_err(std::io::Error::other)??
    };
    match verdict {
        Ok(()) => {
            debug!("model {} verified", model.name);
            Ok(())
        }
        Err(actual) => {
            if offline {
                warn!(
                    "model {} fails verification (expected {expected}, got {actual}) \
                     but offline mode forbids refetching",
                    model.name
                );
                return Ok(());
            }
            if no_overwrite {
                return Err(RealizeError::Fetch(FetchError::Checksum {
                    name: model.name.clone(),
                    expected: expected.to_string(),
                    actual,
                }));
            }
            warn!(
                "model {} fails verification (expected {expected}, got {actual}); replacing",
                model.name
            );
            let cached = fetcher
                .ensure_cached(&source, Some(&expected), &model.name, offline, Some(&target))
                .await?;
            publish(&cached, &target)?;
            Ok(())
        }
    }
}

/// Create (or repoint) a symlink at `link` to `to`.
fn replace_symlink(to: &Path, link: &Path) -> std::io::Result<()> {
    match link.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => fs_err::remove_dir_all(link)?,
        Ok(_) => fs_err::remove_file(link)?,
        Err(_) => {}
    }
    #[cfg(unix)]
    {
        fs_err::os::unix::fs::symlink(to, link)
    }
    #[cfg(not(unix))]
    {
        // Directory symlinks need special handling off unix; fall back to a
        // junction-free copy-less error so the caller can report it.
        Err(std::io::Error::other(format!(
            "cannot link {} on this platform",
            link.display()
        )))
    }
}
