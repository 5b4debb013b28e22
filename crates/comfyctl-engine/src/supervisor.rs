use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use comfyctl_process::{ChildHandle, Command};

use crate::client::{ENGINE_PORT, EngineClient, PromptOutcome};
use crate::error::EngineError;
use crate::outputs::collect_artifacts;

/// How long to wait for the engine to start serving.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for a submitted workflow to finish.
pub const WORKFLOW_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between the polite stop signal and the hard kill.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

const READY_POLL: Duration = Duration::from_secs(1);
const HISTORY_POLL: Duration = Duration::from_secs(2);

/// A produced artifact payload.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    /// With leading dot, e.g. `.png`; `.bin` when unknown.
    pub extension: String,
}

/// Where and how to launch the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub engine_home: PathBuf,
    pub models_dir: PathBuf,
    /// The interpreter used to run the engine entrypoint.
    pub interpreter: PathBuf,
    /// Extra environment passed through from the resolved lock.
    pub env: BTreeMap<String, String>,
}

/// Supervises one engine daemon child.
///
/// One supervisor per process: the engine owns the fixed loopback port, so
/// callers must serialize requests against a single supervisor.
#[derive(Debug)]
pub struct EngineSupervisor {
    settings: EngineSettings,
    client: EngineClient,
    child: Option<ChildHandle>,
}

impl EngineSupervisor {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            client: EngineClient::local(),
            child: None,
        }
    }

    /// Override the control endpoint (tests).
    #[must_use]
    pub fn with_client(mut self, client: EngineClient) -> Self {
        self.client = client;
        self
    }

    pub fn engine_home(&self) -> &Path {
        &self.settings.engine_home
    }

    /// Spawn the engine daemon and attach log readers.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let entrypoint = self.settings.engine_home.join("main.py");
        if !entrypoint.is_file() {
            return Err(EngineError::MissingEntrypoint(entrypoint));
        }

        // The engine's working directories must exist before it binds.
        for dir in ["models", "input", "output", "temp"] {
            fs_err::create_dir_all(self.settings.engine_home.join(dir))?;
        }

        let mut command = Command::new(&self.settings.interpreter)
            .arg(&entrypoint)
            .args(["--listen", "127.0.0.1", "--port"])
            .arg(ENGINE_PORT.to_string())
            .arg("--disable-auto-launch")
            .current_dir(&self.settings.engine_home)
            .env("COMFY_HOME", &self.settings.engine_home)
            .env("MODELS_DIR", &self.settings.models_dir);
        for (key, value) in &self.settings.env {
            command = command.env(key, value);
        }

        let child = command.spawn_logged("engine")?;
        info!(
            "engine started (pid {:?}) from {}",
            child.id(),
            self.settings.engine_home.display()
        );
        self.child = Some(child);
        Ok(())
    }

    /// Poll until the engine serves HTTP, failing fast if the child exits.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_alive()?;
            if self.client.is_ready().await {
                debug!("engine is ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    operation: "engine readiness",
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Submit a graph and poll history to completion.
    pub async fn execute(
        &mut self,
        workflow: &Value,
        timeout: Duration,
    ) -> Result<Artifact, EngineError> {
        let prompt_id = self.client.submit(workflow).await?;
        let deadline = Instant::now() + timeout;
        loop {
            self.check_alive()?;
            match self.client.poll_history(&prompt_id).await? {
                Some(PromptOutcome::Success(outputs)) => {
                    let (bytes, extension) =
                        collect_artifacts(&outputs, &self.settings.engine_home)?;
                    return Ok(Artifact { bytes, extension });
                }
                Some(PromptOutcome::Failed(message)) => {
                    return Err(EngineError::Workflow(message));
                }
                None => {}
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    operation: "workflow completion",
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(HISTORY_POLL).await;
        }
    }

    /// Stop the engine: polite signal, hard kill after `grace`.
    ///
    /// Idempotent; always reaps the child and joins the log readers.
    pub async fn stop(&mut self, grace: Duration) {
        if let Some(child) = self.child.take() {
            child.terminate(grace).await;
            info!("engine stopped");
        }
    }

    fn check_alive(&mut self) -> Result<(), EngineError> {
        let Some(child) = self.child.as_mut() else {
            return Err(EngineError::Crashed {
                exit_code: None,
                last_log: Vec::new(),
            });
        };
        if let Ok(Some(status)) = child.try_status() {
            let last_log = child.log_snapshot();
            return Err(EngineError::Crashed {
                exit_code: status.code(),
                last_log,
            });
        }
        Ok(())
    }
}

/// Run one workflow through a fresh engine instance.
///
/// The engine is always stopped before returning, whatever the outcome.
pub async fn run_workflow(
    settings: EngineSettings,
    workflow: &Value,
) -> Result<Artifact, EngineError> {
    let mut supervisor = EngineSupervisor::new(settings);
    supervisor.start()?;
    let result = async {
        supervisor.wait_ready(READY_TIMEOUT).await?;
        supervisor.execute(workflow, WORKFLOW_TIMEOUT).await
    }
    .await;
    supervisor.stop(STOP_GRACE).await;
    result
}
