use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("offline mode is set, but `{0}` is not in the cache")]
    Offline(String),

    #[error("checksum mismatch for `{name}`: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    #[error(
        "not enough free space for `{context}`: need {required} bytes, {available} bytes available"
    )]
    NoSpace {
        required: u64,
        available: u64,
        context: String,
    },

    #[error("`{0}` is required but was not found on PATH")]
    DependencyMissing(String),

    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported model source: `{0}`")]
    UnsupportedScheme(String),

    #[error("invalid model source `{source_value}`: {reason}")]
    InvalidSource { source_value: String, reason: String },

    #[error("failed to fetch `{url}`")]
    Transport {
        url: String,
        #[source]
        err: reqwest_middleware::Error,
    },

    #[error("`{url}` returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("gsutil cp failed: {0}")]
    GsUtil(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<unknown>".to_string());
        Self::Transport {
            url,
            err: reqwest_middleware::Error::Reqwest(err),
        }
    }
}
