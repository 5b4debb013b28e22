use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine entrypoint not found at {}", .0.display())]
    MissingEntrypoint(PathBuf),

    #[error(
        "engine process exited{}; last output:\n{}",
        .exit_code.map(|code| format!(" with code {code}")).unwrap_or_default(),
        .last_log.join("\n")
    )]
    Crashed {
        exit_code: Option<i32>,
        last_log: Vec<String>,
    },

    #[error("workflow failed: {0}")]
    Workflow(String),

    #[error("timed out waiting for {operation} after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("unexpected engine response from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },

    #[error(transparent)]
    Spawn(#[from] comfyctl_process::SpawnError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The exit code to propagate when the engine itself failed.
    pub fn engine_exit_code(&self) -> Option<i32> {
        match self {
            Self::Crashed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}
