use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read spec at {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("spec at {} is not valid JSON: {err}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("invalid spec at {}: `{field}`: {message}", .path.display())]
    Field {
        path: PathBuf,
        field: String,
        message: String,
    },
}

impl SpecError {
    pub(crate) fn field(path: &std::path::Path, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Field {
            path: path.to_path_buf(),
            field: field.into(),
            message: message.into(),
        }
    }
}
