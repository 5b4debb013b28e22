//! Result emission: base64 payloads or object-storage uploads.
//!
//! Object storage sits behind the [`ArtifactStore`] capability trait; the
//! upload path (naming, MIME, retry schedule, ACL, signed URLs) is identical
//! for the real GCS store and the in-memory double.

use std::path::Path;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use tracing::{debug, warn};

pub use mime::mime_for_extension;
pub use store::{ArtifactStore, GcsStore, MemoryStore};

mod mime;
mod store;

/// Default object-name prefix inside the bucket.
pub const DEFAULT_PREFIX: &str = "comfy/outputs";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("GOOGLE_APPLICATION_CREDENTIALS must point to a readable credential file")]
    Auth,

    #[error("a bucket is required for gcs output")]
    MissingBucket,

    #[error("bucket validation failed: {0}")]
    Validate(String),

    #[error("failed to set public-read ACL: {0}")]
    Acl(String),

    #[error(transparent)]
    Store(#[from] object_store::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode `data` as base64; written to `out_file` when given, otherwise the
/// caller prints the returned payload.
pub fn emit_base64(data: &[u8], out_file: Option<&Path>) -> std::io::Result<String> {
    let payload = BASE64.encode(data);
    if let Some(out_file) = out_file {
        fs_err::write(out_file, &payload)?;
        debug!("base64 payload written to {}", out_file.display());
    }
    Ok(payload)
}

/// Upload behavior knobs, normally read from the environment.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Run the bucket/permission preflight (`GCS_VALIDATE`, default on).
    pub validate: bool,
    /// Grant `allUsers:READER` after upload (`GCS_PUBLIC`).
    pub public: bool,
    /// Also return a signed URL valid this long (`GCS_SIGNED_URL_TTL`).
    pub signed_url_ttl: Option<Duration>,
    /// Total upload attempts (`GCS_RETRIES`, default 3).
    pub attempts: u32,
    /// First retry delay, doubling each attempt (`GCS_RETRY_BASE_SLEEP`,
    /// default 0.5s).
    pub base_sleep: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            validate: true,
            public: false,
            signed_url_ttl: None,
            attempts: 3,
            base_sleep: Duration::from_millis(500),
        }
    }
}

impl UploadOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let signed_url_ttl = std::env::var("GCS_SIGNED_URL_TTL")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|ttl| *ttl > 0)
            .map(Duration::from_secs);
        Self {
            validate: std::env::var("GCS_VALIDATE")
                .map(|value| truthy(&value))
                .unwrap_or(true),
            public: std::env::var("GCS_PUBLIC").is_ok_and(|value| truthy(&value)),
            signed_url_ttl,
            attempts: std::env::var("GCS_RETRIES")
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.attempts),
            base_sleep: std::env::var("GCS_RETRY_BASE_SLEEP")
                .ok()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.base_sleep),
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A completed upload.
#[derive(Debug, Clone)]
pub struct UploadResult {
    /// Public HTTPS form of the object location.
    pub url: String,
    /// `gs://bucket/object`.
    pub gcs_path: String,
    pub signed_url: Option<String>,
    pub size: usize,
    pub extension: String,
}

/// Upload an artifact under `<prefix>/<request_id?>_<UTC>-<rand8><ext>`.
pub async fn upload(
    store: &dyn ArtifactStore,
    data: Vec<u8>,
    extension: &str,
    prefix: Option<&str>,
    request_id: Option<&str>,
    options: &UploadOptions,
) -> Result<UploadResult, SinkError> {
    if options.validate {
        store.verify_access().await?;
    }

    let object = object_name(prefix, request_id, extension);
    let content_type = mime_for_extension(extension);
    let size = data.len();

    let object_ref = &object;
    let attempt = || {
        let data = data.clone();
        async move { store.put(object_ref, data, content_type).await }
    };
    let backoff = ExponentialBuilder::default()
        .with_min_delay(options.base_sleep)
        .with_factor(2.0)
        .with_max_times(options.attempts.saturating_sub(1) as usize);
    attempt
        .retry(backoff)
        .notify(|err, delay| warn!("upload attempt failed: {err}; retrying in {delay:?}"))
        .await?;
    debug!("uploaded {size} bytes to gs://{}/{object}", store.bucket());

    // ACL grant and signed URL are extras: failures degrade, never abort.
    if options.public {
        if let Err(err) = store.grant_public_read(&object).await {
            warn!("{err}");
        }
    }
    let signed_url = match options.signed_url_ttl {
        Some(ttl) => match store.signed_url(&object, ttl).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("failed to generate signed URL: {err}");
                None
            }
        },
        None => None,
    };

    Ok(UploadResult {
        url: format!("https://storage.googleapis.com/{}/{object}", store.bucket()),
        gcs_path: format!("gs://{}/{object}", store.bucket()),
        signed_url,
        size,
        extension: extension.to_string(),
    })
}

fn object_name(prefix: Option<&str>, request_id: Option<&str>, extension: &str) -> String {
    let prefix = prefix
        .filter(|prefix| !prefix.trim().is_empty())
        .unwrap_or(DEFAULT_PREFIX)
        .trim_end_matches('/');
    let timestamp = jiff::Timestamp::now().strftime("%Y%m%dT%H%M%SZ");
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let unique = &unique[..8];
    let extension = normalize_extension(extension);
    match request_id {
        Some(request_id) => {
            let request_prefix: String = request_id
                .chars()
                .filter(|c| *c != '-')
                .take(16)
                .collect();
            format!("{prefix}/{request_prefix}_{timestamp}-{unique}{extension}")
        }
        None => format!("{prefix}/{timestamp}-{unique}{extension}"),
    }
}

fn normalize_extension(extension: &str) -> String {
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}
