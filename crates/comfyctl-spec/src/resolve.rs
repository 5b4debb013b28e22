use thiserror::Error;
use tracing::warn;

use comfyctl_cache::RepositoryUrl;
use comfyctl_fetch::ModelSource;
use comfyctl_git::{GitCache, GitError};

use crate::lock::{ResolvedEngine, ResolvedLock, ResolvedModel, ResolvedNode, ResolvedOptions};
use crate::spec::VersionSpec;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("invalid repository url `{url}`")]
    InvalidRepo {
        url: String,
        #[source]
        err: url::ParseError,
    },

    #[error("model `{source_value}` needs a `name`, a `target_path`, or a source with a file name")]
    UnnamedModel { source_value: String },

    #[error("invalid model source `{source_value}`: {err}")]
    InvalidSource {
        source_value: String,
        #[source]
        err: comfyctl_fetch::FetchError,
    },
}

/// Merge the offline switches: spec option, caller flag, `COMFY_OFFLINE`.
pub fn effective_offline(spec: &VersionSpec, offline_flag: bool) -> bool {
    spec.options.offline || offline_flag || env_truthy("COMFY_OFFLINE")
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Pin every mutable reference in `spec`, producing a deterministic lock.
///
/// Offline resolution of an unpinned engine or plugin logs a warning and
/// records an empty commit; realization will fail later unless the checkout
/// already exists.
pub async fn resolve(
    spec: &VersionSpec,
    git: &GitCache,
    offline_flag: bool,
) -> Result<ResolvedLock, ResolveError> {
    let offline = effective_offline(spec, offline_flag);

    let comfy_commit = match &spec.comfy.commit {
        Some(commit) => commit.clone(),
        None if offline => {
            warn!(
                "offline: cannot resolve `{}` for {}; continuing unpinned",
                spec.comfy.reference.as_deref().unwrap_or("HEAD"),
                spec.comfy.repo
            );
            String::new()
        }
        None => {
            git.resolve_ref(&spec.comfy.repo, spec.comfy.reference.as_deref())
                .await?
        }
    };

    let mut custom_nodes = Vec::with_capacity(spec.custom_nodes.len());
    for node in &spec.custom_nodes {
        let name = match &node.name {
            Some(name) => name.clone(),
            None => RepositoryUrl::parse(&node.repo)
                .map_err(|err| ResolveError::InvalidRepo {
                    url: node.repo.clone(),
                    err,
                })?
                .slug(),
        };
        let commit = match &node.commit {
            Some(commit) => commit.clone(),
            None if offline => {
                warn!(
                    "offline: cannot resolve `{}` for {}; continuing unpinned",
                    node.reference.as_deref().unwrap_or("HEAD"),
                    node.repo
                );
                String::new()
            }
            None => {
                git.resolve_ref(&node.repo, node.reference.as_deref())
                    .await?
            }
        };
        custom_nodes.push(ResolvedNode {
            name,
            repo: node.repo.clone(),
            reference: node.reference.clone(),
            commit,
        });
    }

    let mut models = Vec::with_capacity(spec.models.len());
    for model in &spec.models {
        let source =
            ModelSource::parse(&model.source).map_err(|err| ResolveError::InvalidSource {
                source_value: model.source.clone(),
                err,
            })?;
        let name = match &model.name {
            Some(name) => name.clone(),
            None => source
                .file_name()
                .ok_or_else(|| ResolveError::UnnamedModel {
                    source_value: model.source.clone(),
                })?,
        };
        let target_path = match &model.target_path {
            Some(target_path) => target_path.clone(),
            None => match &model.target_subdir {
                Some(subdir) => format!("{}/{name}", subdir.trim_end_matches('/')),
                None => {
                    warn!("model `{name}` has no target_subdir; placing at the models root");
                    name.clone()
                }
            },
        };
        models.push(ResolvedModel {
            source: model.source.clone(),
            name,
            target_subdir: model.target_subdir.clone(),
            target_path,
            checksum: model.checksum.clone(),
        });
    }

    Ok(ResolvedLock {
        schema_version: spec.schema_version,
        version_id: spec.version_id.clone(),
        comfy: ResolvedEngine {
            repo: spec.comfy.repo.clone(),
            reference: spec.comfy.reference.clone(),
            commit: comfy_commit,
        },
        custom_nodes,
        models,
        env: spec.env.clone(),
        options: ResolvedOptions {
            offline,
            skip_models: spec.options.skip_models,
        },
    })
}
