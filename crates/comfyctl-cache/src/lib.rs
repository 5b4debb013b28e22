use std::fmt::{Display, Formatter};
use std::io;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use fs_err as fs;

pub use canonical_url::RepositoryUrl;
pub use digest::hash_digest;
pub use volume::{builds_root, runpod_volume};

mod canonical_url;
mod digest;
mod volume;

/// Environment variables that override the cache root, first match wins.
const CACHE_ROOT_ENV_VARS: &[&str] = &["COMFY_CACHE_ROOT", "RUNPOD_COMFY_CACHE", "COMFY_CACHE"];

/// Directory name under which all derived state lives.
const CACHE_ROOT_NAME: &str = "runpod-comfy";

/// A cache entry which may or may not exist yet.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub dir: PathBuf,
    pub file: String,
}

impl CacheEntry {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }

    #[must_use]
    pub fn with_file(self, file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..self
        }
    }
}

/// A subdirectory within the cache.
#[derive(Debug, Clone)]
pub struct CacheShard(PathBuf);

impl CacheShard {
    pub fn entry(&self, file: impl Into<String>) -> CacheEntry {
        CacheEntry {
            dir: self.0.clone(),
            file: file.into(),
        }
    }
}

impl Deref for CacheShard {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The cache root holding all long-lived derived state: content-addressed
/// model artifacts, git repository caches, and resolved-lock documents.
#[derive(Debug, Clone)]
pub struct Cache {
    /// The cache directory.
    root: PathBuf,
}

impl Cache {
    /// A persistent cache directory at `root`.
    pub fn from_path(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        Ok(Self {
            root: Self::init(root)?,
        })
    }

    /// Discover the cache root from the environment.
    ///
    /// Prefer, in order:
    /// 1. An explicit directory passed by the caller (`--cache-dir`).
    /// 2. The first of `COMFY_CACHE_ROOT`, `RUNPOD_COMFY_CACHE`, `COMFY_CACHE`.
    /// 3. `<volume>/cache/runpod-comfy` when a writable RunPod volume is mounted.
    /// 4. `$XDG_CACHE_HOME/runpod-comfy`, falling back to `$HOME/.cache/runpod-comfy`.
    pub fn from_settings(cache_dir: Option<PathBuf>) -> Result<Self, io::Error> {
        if let Some(cache_dir) = cache_dir {
            return Self::from_path(cache_dir);
        }
        for var in CACHE_ROOT_ENV_VARS {
            if let Some(value) = std::env::var_os(var) {
                if !value.is_empty() {
                    return Self::from_path(PathBuf::from(value));
                }
            }
        }
        if let Some(volume) = runpod_volume() {
            tracing::debug!("using volume-backed cache root under {}", volume.display());
            return Self::from_path(volume.join("cache").join(CACHE_ROOT_NAME));
        }
        let root = user_cache_dir()
            .ok_or_else(|| io::Error::other("could not determine a user cache directory"))?;
        Self::from_path(root.join(CACHE_ROOT_NAME))
    }

    /// Return the root of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The folder for a specific cache bucket.
    pub fn bucket(&self, cache_bucket: CacheBucket) -> PathBuf {
        self.root.join(cache_bucket.to_str())
    }

    /// Compute a shard within a bucket.
    pub fn shard(&self, cache_bucket: CacheBucket, dir: impl AsRef<Path>) -> CacheShard {
        CacheShard(self.bucket(cache_bucket).join(dir.as_ref()))
    }

    /// Compute an entry in the cache.
    pub fn entry(
        &self,
        cache_bucket: CacheBucket,
        dir: impl AsRef<Path>,
        file: String,
    ) -> CacheEntry {
        CacheEntry {
            dir: self.bucket(cache_bucket).join(dir.as_ref()),
            file,
        }
    }

    /// Initialize a directory for use as a cache.
    fn init(root: impl Into<PathBuf>) -> Result<PathBuf, io::Error> {
        let root = root.into();

        fs::create_dir_all(&root)?;

        // Add the CACHEDIR.TAG.
        cachedir::ensure_tag(&root)?;

        // Add the .gitignore.
        let gitignore_path = root.join(".gitignore");
        if !gitignore_path.exists() {
            let mut file = fs::File::create(gitignore_path)?;
            file.write_all(b"*")?;
        }

        let root = fs::canonicalize(root)?;

        // The buckets are fixed; create them up front so every component can
        // assume its bucket directory exists.
        for bucket in CacheBucket::ALL {
            fs::create_dir_all(root.join(bucket.to_str()))?;
        }

        Ok(root)
    }
}

/// The different kinds of data in the cache are stored in different buckets,
/// which in our case are subdirectories of the cache root.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CacheBucket {
    /// Content-addressed model artifacts.
    ///
    /// Cache structure:
    ///  * `models/<algo>-<hex><suffix>` when the checksum is declared
    ///  * `models/src-<digest(source)><suffix>` when it is not
    ///
    /// Entries are immutable once published; publication is always
    /// write-to-sibling-tempfile followed by a rename on the same mount.
    Models,
    /// Engine repository caches, one per canonical repository URL.
    ///
    /// Cache structure: `comfy/<repo-slug>/.git`. Working copies are produced
    /// with `git clone --shared` against these caches.
    Engine,
    /// Plugin checkouts, keyed by slug and commit.
    ///
    /// Cache structure: `custom_nodes/<slug>@<commit>/`. The commit-level path
    /// makes concurrent realizations of different versions non-colliding.
    Nodes,
    /// Resolved-lock documents, one per version id.
    ///
    /// Cache structure: `resolved/<version_id>.lock.json`, rewritten
    /// atomically on every resolve.
    Resolved,
}

impl CacheBucket {
    const ALL: [Self; 4] = [Self::Models, Self::Engine, Self::Nodes, Self::Resolved];

    fn to_str(self) -> &'static str {
        match self {
            Self::Models => "models",
            Self::Engine => "comfy",
            Self::Nodes => "custom_nodes",
            Self::Resolved => "resolved",
        }
    }
}

impl Display for CacheBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

/// The user-level cache directory (`$XDG_CACHE_HOME`, else `$HOME/.cache`).
fn user_cache_dir() -> Option<PathBuf> {
    use etcetera::BaseStrategy;
    etcetera::choose_base_strategy()
        .ok()
        .map(|strategy| strategy.cache_dir())
}

/// The default engine home for a version.
///
/// A user-supplied target always wins; this computes the fallback:
/// `<volume>/builds/comfy-<version_id>` when a writable volume is mounted,
/// else the `COMFY_HOME` override, else `$HOME/comfy-<version_id>`, else
/// `./comfy-<version_id>`.
pub fn default_engine_home(version_id: &str) -> PathBuf {
    let leaf = format!("comfy-{version_id}");
    if runpod_volume().is_some() {
        return builds_root().join(leaf);
    }
    if let Some(home) = std::env::var_os("COMFY_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(home) = etcetera::home_dir() {
        return home.join(leaf);
    }
    PathBuf::from(".").join(leaf)
}

/// The default models directory: `MODELS_DIR` if set, else `<volume>/models`
/// if a volume is mounted, else `<engine_home>/models`.
pub fn default_models_dir(engine_home: &Path) -> PathBuf {
    if let Some(dir) = std::env::var_os("MODELS_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(volume) = runpod_volume() {
        return volume.join("models");
    }
    engine_home.join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_layout() -> Result<(), io::Error> {
        let dir = tempfile::tempdir()?;
        let cache = Cache::from_path(dir.path().join("cache"))?;
        for bucket in [
            CacheBucket::Models,
            CacheBucket::Engine,
            CacheBucket::Nodes,
            CacheBucket::Resolved,
        ] {
            assert!(cache.bucket(bucket).is_dir());
        }
        assert!(cache.root().join("CACHEDIR.TAG").is_file());
        Ok(())
    }

    #[test]
    fn entry_path() -> Result<(), io::Error> {
        let dir = tempfile::tempdir()?;
        let cache = Cache::from_path(dir.path())?;
        let entry = cache.entry(CacheBucket::Resolved, "", "wan22.lock.json".to_string());
        assert_eq!(
            entry.path(),
            cache.root().join("resolved").join("wan22.lock.json")
        );
        Ok(())
    }
}
