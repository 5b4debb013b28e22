use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use comfyctl_cache::{Cache, CacheBucket};
use comfyctl_process::Command;

use crate::checksum::{Checksum, ChecksumAlgorithm, hash_file};
use crate::disk::{VolumeQuota, available_for};
use crate::error::FetchError;
use crate::source::{ModelSource, SourceKind};

/// Interval between download progress log lines.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Default per-request deadline for model downloads, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 180;

/// Default size of the worker pool for parallel cache warming.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// How a cached artifact reached its target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The target already pointed at the cached file.
    Present,
    /// A symlink into the cache was created.
    Linked,
    /// The filesystem rejected a symlink; the bytes were copied.
    Copied,
}

/// Downloads model artifacts into the content-addressed cache and publishes
/// them to their target paths.
///
/// Safe under concurrent invocation: every download lands in a unique sibling
/// tempfile and the rename into the canonical path is idempotent.
pub struct Fetcher {
    client: ClientWithMiddleware,
    cache: Cache,
    quota: Option<VolumeQuota>,
}

impl Fetcher {
    pub fn new(cache: Cache) -> Self {
        let timeout = std::env::var("COMFY_MODELS_TIMEOUT")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .user_agent(concat!("comfyctl/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout))
            .build()
            .expect("Failed to build HTTP client.");
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            client,
            cache,
            quota: VolumeQuota::from_env(),
        }
    }

    /// Override the declared volume quota (tests).
    #[must_use]
    pub fn with_quota(mut self, quota: Option<VolumeQuota>) -> Self {
        self.quota = quota;
        self
    }

    /// Ensure `source` is present in the content-addressed cache and return
    /// its canonical cache path.
    ///
    /// `target_hint`, when given, is included in the free-space preflight so a
    /// copy-published target fails early rather than mid-write.
    pub async fn ensure_cached(
        &self,
        source: &ModelSource,
        checksum: Option<&Checksum>,
        display_name: &str,
        offline: bool,
        target_hint: Option<&Path>,
    ) -> Result<PathBuf, FetchError> {
        let cache_dir = self.cache.bucket(CacheBucket::Models);
        let cached = cache_dir.join(cache_file_name(source, checksum));

        if cached.exists() {
            match checksum {
                Some(expected) => {
                    let verdict = verify_file(&cached, expected).await?;
                    match verdict {
                        Ok(()) => {
                            debug!("cache hit for {display_name}: {}", cached.display());
                            return Ok(cached);
                        }
                        Err(actual) => {
                            if offline {
                                return Err(FetchError::Checksum {
                                    name: display_name.to_string(),
                                    expected: expected.to_string(),
                                    actual,
                                });
                            }
                            warn!(
                                "cached artifact for {display_name} failed verification \
                                 (expected {expected}, got {actual}); refetching"
                            );
                            fs_err::remove_file(&cached)?;
                        }
                    }
                }
                // Without a declared checksum, an existing entry is trusted.
                None => {
                    debug!("cache hit for {display_name}: {}", cached.display());
                    return Ok(cached);
                }
            }
        }

        if offline {
            return Err(FetchError::Offline(display_name.to_string()));
        }

        self.preflight(source, display_name, &cache_dir, target_hint)
            .await?;

        // Download into a sibling tempfile: same mount, so the final rename
        // never crosses devices and readers never observe partial content.
        let temp = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempfile_in(&cache_dir)?;
        self.download(source, display_name, temp.path()).await?;

        match checksum {
            Some(expected) => {
                if let Err(actual) = verify_file(temp.path(), expected).await? {
                    return Err(FetchError::Checksum {
                        name: display_name.to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            None => {
                // Derive a digest so the artifact can be pinned later.
                let derived = hash_blocking(temp.path().to_path_buf()).await?;
                info!("derived checksum for {display_name}: sha256:{derived}");
            }
        }

        temp.persist(&cached).map_err(|err| err.error)?;
        debug!("cached {display_name} at {}", cached.display());
        Ok(cached)
    }

    /// Warm the cache for several artifacts with a bounded worker pool.
    ///
    /// Completion order is irrelevant: all workers publish into the shared
    /// immutable cache.
    pub async fn ensure_cached_all(
        &self,
        jobs: &[(ModelSource, Option<Checksum>, String)],
        offline: bool,
        concurrency: usize,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let concurrency = concurrency.max(1);
        let results = futures::stream::iter(jobs.iter().map(|(source, checksum, name)| {
            self.ensure_cached(source, checksum.as_ref(), name, offline, None)
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;
        results.into_iter().collect()
    }

    /// Ask the remote for the artifact size and fail with `NoSpace` when the
    /// cache directory (or the publish target) cannot hold it.
    async fn preflight(
        &self,
        source: &ModelSource,
        display_name: &str,
        cache_dir: &Path,
        target_hint: Option<&Path>,
    ) -> Result<(), FetchError> {
        let Some(required) = self.content_length(source).await else {
            debug!("size of {display_name} unknown; skipping space preflight");
            return Ok(());
        };

        let mut contexts = vec![(cache_dir.to_path_buf(), "cache directory")];
        if let Some(target) = target_hint {
            if let Some(parent) = target.parent() {
                contexts.push((parent.to_path_buf(), "target directory"));
            }
        }
        for (dir, what) in contexts {
            let available = available_for(&dir, self.quota.as_ref())?;
            if available < required {
                error!(
                    "not enough space for {display_name} in {what} {}: \
                     required={required} available={available}",
                    dir.display()
                );
                return Err(FetchError::NoSpace {
                    required,
                    available,
                    context: format!("{display_name} ({what})"),
                });
            }
        }
        Ok(())
    }

    /// Best-effort size lookup, scheme-specific. `None` when unknown.
    async fn content_length(&self, source: &ModelSource) -> Option<u64> {
        match source.kind() {
            SourceKind::Http(url) => {
                self.head_content_length(url.as_str(), &hf_headers(url.host_str()))
                    .await
            }
            SourceKind::Path(path) => fs_err::metadata(path).ok().map(|meta| meta.len()),
            SourceKind::Gs(url) => gsutil_content_length(url).await,
            SourceKind::Hf(hf) => {
                self.head_content_length(&hf.resolve_url(), &hf_headers(Some("huggingface.co")))
                    .await
            }
            SourceKind::Civitai(civitai) => {
                let url = civitai.download_url().ok()?;
                if let Some(length) = self.head_content_length(&url, &civitai_headers()).await {
                    return Some(length);
                }
                self.civitai_api_size(civitai.version_id()?).await
            }
        }
    }

    async fn head_content_length(&self, url: &str, headers: &[(&str, String)]) -> Option<u64> {
        let mut request = self.client.head(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.content_length().filter(|length| *length > 0)
    }

    /// Size fallback via the civitai model-versions API.
    async fn civitai_api_size(&self, version_id: &str) -> Option<u64> {
        let url = format!("https://civitai.com/api/v1/model-versions/{version_id}");
        let mut request = self.client.get(&url);
        for (name, value) in &civitai_headers() {
            request = request.header(*name, value);
        }
        let response = request.send().await.ok()?;
        let doc: serde_json::Value = response.json().await.ok()?;
        let files = doc.get("files")?.as_array()?;
        let chosen = files
            .iter()
            .find(|file| {
                let format = file.get("format").and_then(|v| v.as_str()).unwrap_or("");
                let name = file
                    .get("name")
                    .or_else(|| file.get("fileName"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                format.eq_ignore_ascii_case("safetensor") || name.ends_with(".safetensors")
            })
            .or_else(|| files.first())?;
        let size_kb = chosen.get("sizeKB")?.as_f64()?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some((size_kb * 1024.0) as u64)
    }

    async fn download(
        &self,
        source: &ModelSource,
        display_name: &str,
        dest: &Path,
    ) -> Result<(), FetchError> {
        match source.kind() {
            SourceKind::Http(url) => {
                self.download_http(url.as_str(), &hf_headers(url.host_str()), display_name, dest)
                    .await
            }
            SourceKind::Path(path) => {
                if !path.exists() {
                    return Err(FetchError::NotFound(path.clone()));
                }
                fs_err::tokio::copy(path, dest).await?;
                Ok(())
            }
            SourceKind::Gs(url) => download_gs(url, dest).await,
            SourceKind::Hf(hf) => {
                self.download_http(
                    &hf.resolve_url(),
                    &hf_headers(Some("huggingface.co")),
                    display_name,
                    dest,
                )
                .await
            }
            SourceKind::Civitai(civitai) => {
                self.download_http(
                    &civitai.download_url()?,
                    &civitai_headers(),
                    display_name,
                    dest,
                )
                .await
            }
        }
    }

    async fn download_http(
        &self,
        url: &str,
        headers: &[(&str, String)],
        display_name: &str,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                err,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_log = Instant::now();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::from)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if last_log.elapsed() >= PROGRESS_INTERVAL {
                match total {
                    Some(total) => debug!("{display_name}: {downloaded}/{total} bytes"),
                    None => debug!("{display_name}: {downloaded} bytes"),
                }
                last_log = Instant::now();
            }
        }
        file.flush().await?;
        debug!("{display_name}: downloaded {downloaded} bytes");
        Ok(())
    }
}

/// Publish a cached artifact at `target`.
///
/// Prefers a symlink into the cache; falls back to a copy when the filesystem
/// rejects links. The target is never observed half-written: symlink creation
/// is atomic and copies go through a sibling tempfile rename.
pub fn publish(cache_path: &Path, target: &Path) -> Result<Publish, FetchError> {
    if let Some(parent) = target.parent() {
        fs_err::create_dir_all(parent)?;
    }

    if same_file(cache_path, target) {
        return Ok(Publish::Present);
    }

    // Replace any prior symlink or stale file.
    if target.symlink_metadata().is_ok() {
        fs_err::remove_file(target)?;
    }

    #[cfg(unix)]
    {
        match fs_err::os::unix::fs::symlink(cache_path, target) {
            Ok(()) => return Ok(Publish::Linked),
            Err(err) => {
                debug!(
                    "symlink to {} rejected ({err}); copying instead",
                    target.display()
                );
            }
        }
    }

    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".publish-")
        .tempfile_in(parent)?;
    fs_err::copy(cache_path, temp.path())?;
    temp.persist(target).map_err(|err| err.error)?;
    Ok(Publish::Copied)
}

/// Whether two paths resolve to the same inode.
fn same_file(a: &Path, b: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match (std::fs::metadata(a), std::fs::metadata(b)) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// The canonical cache file name for a source/checksum pair.
///
/// `<algo>-<hex><suffix>` when the checksum is known, else a digest of the
/// source string: `src-<sha1[..16]><suffix>`.
fn cache_file_name(source: &ModelSource, checksum: Option<&Checksum>) -> String {
    let suffix = source.suffix().unwrap_or_default();
    match checksum {
        Some(checksum) => format!(
            "{}-{}{suffix}",
            checksum.algorithm().as_str(),
            checksum.digest()
        ),
        None => {
            let digest = hex::encode(Sha1::digest(source.as_str().as_bytes()));
            format!("src-{}{suffix}", &digest[..16])
        }
    }
}

async fn verify_file(path: &Path, expected: &Checksum) -> Result<Result<(), String>, FetchError> {
    let path = path.to_path_buf();
    let expected = expected.clone();
    let verdict = tokio::task::spawn_blocking(move || expected.matches_file(&path))
        .await
        .map_err(|err| FetchError::Io(std::io::Error::other(err)))??;
    Ok(verdict)
}

async fn hash_blocking(path: PathBuf) -> Result<String, FetchError> {
    tokio::task::spawn_blocking(move || hash_file(&path, ChecksumAlgorithm::Sha256))
        .await
        .map_err(|err| FetchError::Io(std::io::Error::other(err)))?
        .map_err(FetchError::from)
}

fn hf_headers(host: Option<&str>) -> Vec<(&'static str, String)> {
    let Some(host) = host else {
        return Vec::new();
    };
    if !host.contains("huggingface") {
        return Vec::new();
    }
    hf_token()
        .map(|token| vec![("authorization", format!("Bearer {token}"))])
        .unwrap_or_default()
}

fn hf_token() -> Option<String> {
    ["HUGGINGFACE_TOKEN", "HF_TOKEN"].iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .filter(|value| !value.trim().is_empty())
    })
}

fn civitai_headers() -> Vec<(&'static str, String)> {
    std::env::var("CIVITAI_TOKEN")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|token| vec![("authorization", format!("Bearer {token}"))])
        .unwrap_or_default()
}

async fn download_gs(url: &str, dest: &Path) -> Result<(), FetchError> {
    let Ok(gsutil) = which::which("gsutil") else {
        return Err(FetchError::DependencyMissing("gsutil".to_string()));
    };
    let output = Command::new(gsutil)
        .args(["-q", "cp", url])
        .arg(dest)
        .output()
        .await;
    if !output.success() {
        return Err(FetchError::GsUtil(output.stderr));
    }
    Ok(())
}

async fn gsutil_content_length(url: &str) -> Option<u64> {
    let gsutil = which::which("gsutil").ok()?;
    let output = Command::new(gsutil).args(["stat", url]).output().await;
    if !output.success() {
        return None;
    }
    output.stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "Content-Length" {
            return None;
        }
        value.trim().parse().ok()
    })
}
