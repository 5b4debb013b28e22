//! Gateway for the external commands the orchestrator shells out to (`git`,
//! `pip`, `gsutil`, the engine itself).
//!
//! Two modes: [`Command::output`] for short-lived helpers with captured
//! streams, and [`Command::spawn_logged`] for long-lived children whose
//! output is tee-forwarded to logs while a bounded ring buffer keeps the tail
//! for diagnostics.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

pub use spawn::{ChildHandle, LogRing};

mod spawn;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        err: std::io::Error,
    },
}

/// The result of a captured subprocess run.
///
/// Failures to launch (missing executable, permission denied) and timeouts
/// are folded into this shape with exit code `-1` rather than surfaced as
/// errors; callers inspect [`Output::success`] and the captured stderr.
#[derive(Debug, Clone)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn failure(message: String) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// Builder for an external command.
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    timeout: Option<Duration>,
}

impl Command {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// A `program arg arg...` rendering for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    /// Run to completion, capturing both streams.
    ///
    /// Timeouts and launch failures never panic or propagate; they come back
    /// as an [`Output`] with exit code `-1` and the error text on stderr.
    pub async fn output(&self) -> Output {
        debug!("running: {}", self.display());

        let mut command = self.build();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the in-flight future on timeout must not leak a child.
            .kill_on_drop(true);

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Output::failure(format!(
                        "`{}` timed out after {}s",
                        self.display(),
                        limit.as_secs()
                    ));
                }
            },
            None => command.output().await,
        };

        match result {
            Ok(output) => Output {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Err(err) => Output::failure(format!("failed to run `{}`: {err}", self.display())),
        }
    }

    /// Spawn a long-lived child with both streams tee-forwarded to logs.
    ///
    /// The returned handle keeps the last 20 output lines for diagnostics and
    /// must be reaped via [`ChildHandle::wait`] or [`ChildHandle::terminate`].
    pub fn spawn_logged(&self, label: impl Into<String>) -> Result<ChildHandle, SpawnError> {
        let label = label.into();
        debug!("spawning {label}: {}", self.display());

        let mut command = self.build();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| SpawnError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            err,
        })?;

        Ok(ChildHandle::new(child, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_streams() {
        let output = Command::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .output()
            .await;
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[tokio::test]
    async fn missing_executable_is_structured() {
        let output = Command::new("definitely-not-a-real-binary").output().await;
        assert_eq!(output.exit_code, -1);
        assert!(!output.stderr.is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_minus_one() {
        let output = Command::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50))
            .output()
            .await;
        assert_eq!(output.exit_code, -1);
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn nonzero_exit_code() {
        let output = Command::new("sh").args(["-c", "exit 3"]).output().await;
        assert_eq!(output.exit_code, 3);
    }
}
