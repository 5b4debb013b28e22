//! Git support for pinned engine and plugin checkouts.
//!
//! Every repository gets a cache under `<cache_root>/comfy/<slug>/`; working
//! copies are produced with `git clone --shared` against that cache and then
//! forced onto the pinned commit. The git CLI does the work; any non-zero
//! exit is translated into a staged [`GitError`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use comfyctl_cache::{Cache, CacheBucket, RepositoryUrl};
use comfyctl_process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {stage} failed: {stderr}")]
    Git { stage: &'static str, stderr: String },

    #[error("offline mode is set, but `{0}` is not in the git cache")]
    OfflineMissingObject(String),

    #[error("could not resolve `{reference}` against {repo}")]
    RefNotFound { repo: String, reference: String },

    #[error("invalid repository url `{url}`: {err}")]
    InvalidUrl {
        url: String,
        #[source]
        err: url::ParseError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Whether `value` already is a full commit id (40 lowercase hex characters).
pub fn is_commit_hash(value: &str) -> bool {
    value.len() == 40
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Per-repository caches plus pinned working copies.
#[derive(Debug, Clone)]
pub struct GitCache {
    cache: Cache,
}

impl GitCache {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// The cache directory for a repository.
    pub fn repo_cache_dir(&self, repo: &str) -> Result<PathBuf, GitError> {
        let url = RepositoryUrl::parse(repo).map_err(|err| GitError::InvalidUrl {
            url: repo.to_string(),
            err,
        })?;
        Ok(self.cache.bucket(CacheBucket::Engine).join(url.slug()))
    }

    /// The pinned working-copy directory for a plugin.
    pub fn node_checkout_dir(&self, repo: &str, commit: &str) -> Result<PathBuf, GitError> {
        let url = RepositoryUrl::parse(repo).map_err(|err| GitError::InvalidUrl {
            url: repo.to_string(),
            err,
        })?;
        Ok(self
            .cache
            .bucket(CacheBucket::Nodes)
            .join(format!("{}@{commit}", url.slug())))
    }

    /// Ensure a cache clone of `repo` exists, refreshing it when online.
    pub async fn ensure_repo_cache(&self, repo: &str, offline: bool) -> Result<PathBuf, GitError> {
        let cache_dir = self.repo_cache_dir(repo)?;

        if !cache_dir.join(".git").exists() {
            if offline {
                return Err(GitError::OfflineMissingObject(repo.to_string()));
            }
            debug!("cloning {repo} into {}", cache_dir.display());
            if let Some(parent) = cache_dir.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let output = git().arg("clone").arg(repo).arg(&cache_dir).output().await;
            if !output.success() {
                return Err(GitError::Git {
                    stage: "clone",
                    stderr: output.stderr,
                });
            }
        } else if !offline {
            // Refresh is best effort: a stale cache is still usable as long
            // as it has the pinned commits.
            let output = git()
                .arg("-C")
                .arg(&cache_dir)
                .args(["fetch", "--all", "--tags", "-q"])
                .output()
                .await;
            if !output.success() {
                warn!("git fetch for {repo} failed: {}", output.stderr);
            }
        }

        Ok(cache_dir)
    }

    /// Produce a working copy of `cache_dir` pinned to `commit`.
    pub async fn materialize_working_copy(
        &self,
        cache_dir: &Path,
        target_dir: &Path,
        commit: &str,
        offline: bool,
    ) -> Result<(), GitError> {
        // A target without `.git` is leftover debris from something else.
        if target_dir.exists() && !target_dir.join(".git").exists() {
            debug!(
                "removing non-git directory at {} before checkout",
                target_dir.display()
            );
            fs_err::remove_dir_all(target_dir)?;
        }

        if !target_dir.exists() {
            if let Some(parent) = target_dir.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let output = git()
                .args(["clone", "--shared"])
                .arg(cache_dir)
                .arg(target_dir)
                .output()
                .await;
            if !output.success() {
                return Err(GitError::Git {
                    stage: "clone --shared",
                    stderr: output.stderr,
                });
            }
        }

        self.verify_commit(cache_dir, commit, offline).await?;

        // Point origin at the cache so every later fetch is offline.
        let set_url = git()
            .arg("-C")
            .arg(target_dir)
            .args(["remote", "set-url", "origin"])
            .arg(cache_dir)
            .output()
            .await;
        if !set_url.success() {
            return Err(GitError::Git {
                stage: "remote set-url",
                stderr: set_url.stderr,
            });
        }

        for (stage, args) in [
            ("fetch", vec!["fetch", "origin", "--tags", "-q"]),
            ("checkout", vec!["checkout", "--force", commit]),
            ("reset", vec!["reset", "--hard", commit]),
            ("clean", vec!["clean", "-fdx"]),
        ] {
            let output = git().arg("-C").arg(target_dir).args(args).output().await;
            if !output.success() {
                return Err(GitError::Git {
                    stage,
                    stderr: output.stderr,
                });
            }
        }

        debug!("{} pinned to {commit}", target_dir.display());
        Ok(())
    }

    /// Resolve a symbolic ref (or `HEAD`) to a commit id via `ls-remote`.
    ///
    /// Short-circuits without any network traffic when the ref already looks
    /// like a full commit id.
    pub async fn resolve_ref(
        &self,
        repo: &str,
        reference: Option<&str>,
    ) -> Result<String, GitError> {
        if let Some(reference) = reference {
            if is_commit_hash(reference) {
                return Ok(reference.to_string());
            }
        }

        let reference = reference.unwrap_or("HEAD");
        let output = git()
            .args(["ls-remote", repo, reference])
            .output()
            .await;
        if !output.success() {
            return Err(GitError::Git {
                stage: "ls-remote",
                stderr: output.stderr,
            });
        }

        output
            .stdout
            .lines()
            .find_map(|line| {
                let commit = line.split_whitespace().next()?;
                is_commit_hash(commit).then(|| commit.to_string())
            })
            .ok_or_else(|| GitError::RefNotFound {
                repo: repo.to_string(),
                reference: reference.to_string(),
            })
    }

    /// Check that `commit` is present in the cache, fetching once to recover
    /// when online.
    async fn verify_commit(
        &self,
        cache_dir: &Path,
        commit: &str,
        offline: bool,
    ) -> Result<(), GitError> {
        if self.commit_exists(cache_dir, commit).await {
            return Ok(());
        }
        if offline {
            return Err(GitError::OfflineMissingObject(commit.to_string()));
        }
        let output = git()
            .arg("-C")
            .arg(cache_dir)
            .args(["fetch", "--all", "--tags", "-q"])
            .output()
            .await;
        if !output.success() {
            warn!("git fetch while looking for {commit} failed: {}", output.stderr);
        }
        if self.commit_exists(cache_dir, commit).await {
            return Ok(());
        }
        Err(GitError::Git {
            stage: "cat-file",
            stderr: format!("commit {commit} not found in {}", cache_dir.display()),
        })
    }

    async fn commit_exists(&self, cache_dir: &Path, commit: &str) -> bool {
        git()
            .arg("-C")
            .arg(cache_dir)
            .args(["cat-file", "-e", &format!("{commit}^{{commit}}")])
            .output()
            .await
            .success()
    }
}

fn git() -> Command {
    Command::new("git").env("GIT_TERMINAL_PROMPT", "0")
}
