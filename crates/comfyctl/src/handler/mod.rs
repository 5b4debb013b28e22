//! The request shell: decode an envelope, materialize the workflow, stage
//! inputs, run the resolve-realize-execute pipeline, emit the result.
//!
//! Every failure is folded into an `{"error": …}` envelope; per-request
//! files (the workflow tempfile and staged inputs) are removed whether or
//! not the workflow succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use comfyctl_cache::Cache;
use comfyctl_engine::{Artifact, EngineError, EngineSettings};
use comfyctl_git::GitCache;
use comfyctl_realize::{RealizeSettings, RealizedEnv};
use comfyctl_sink::{ArtifactStore, GcsStore, UploadOptions};
use comfyctl_spec::VersionSpec;

use crate::commands::existing_spec_path;

pub(crate) use images::{cleanup_inputs, request_prefix, stage_inputs};
pub(crate) use rewrite::rewrite_workflow;

mod images;
mod rewrite;

/// Executes a materialized workflow file against a prepared engine home.
///
/// The real implementation boots the engine; tests substitute a stub.
#[async_trait]
pub(crate) trait WorkflowRunner: Send + Sync {
    async fn run(
        &self,
        settings: EngineSettings,
        workflow_path: &Path,
    ) -> Result<Artifact, EngineError>;
}

/// Boots a fresh engine instance per request.
pub(crate) struct EngineRunner;

#[async_trait]
impl WorkflowRunner for EngineRunner {
    async fn run(
        &self,
        settings: EngineSettings,
        workflow_path: &Path,
    ) -> Result<Artifact, EngineError> {
        let text = fs_err::read_to_string(workflow_path)?;
        let workflow: Value = serde_json::from_str(&text)
            .map_err(|err| EngineError::Workflow(format!("workflow is not valid JSON: {err}")))?;
        comfyctl_engine::run_workflow(settings, &workflow).await
    }
}

/// A decoded request envelope.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub(crate) version_id: Option<String>,
    pub(crate) workflow: Option<Value>,
    pub(crate) workflow_url: Option<String>,
    pub(crate) input_images: Option<BTreeMap<String, String>>,
    pub(crate) images: Option<Vec<ImageRef>>,
    pub(crate) output_mode: Option<String>,
    pub(crate) gcs_bucket: Option<String>,
    pub(crate) gcs_prefix: Option<String>,
    pub(crate) models_dir: Option<String>,
    pub(crate) out_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageRef {
    pub(crate) name: String,
    pub(crate) image: String,
}

/// The request shell's collaborators.
pub(crate) struct RequestShell {
    pub(crate) cache: Cache,
    pub(crate) specs_dir: PathBuf,
    pub(crate) runner: Box<dyn WorkflowRunner>,
    /// Injected store double; when absent, gcs output connects for real.
    pub(crate) store: Option<Box<dyn ArtifactStore>>,
    /// Explicit engine-home override; the conventional path otherwise.
    pub(crate) target: Option<PathBuf>,
    pub(crate) offline: bool,
}

impl RequestShell {
    pub(crate) fn new(cache: Cache, specs_dir: PathBuf) -> Self {
        Self {
            cache,
            specs_dir,
            runner: Box::new(EngineRunner),
            store: None,
            target: None,
            offline: false,
        }
    }

    /// Process one request envelope. Never fails: errors become
    /// `{"error": message}`. The second element carries the engine's exit
    /// code when the failure was an engine crash, for CLI propagation.
    pub(crate) async fn handle(&self, event: &Value, request_id: Option<&str>) -> (Value, Option<i32>) {
        // Accept both a wrapped `{"input": …}` event and a bare payload.
        let payload = event.get("input").filter(|v| v.is_object()).unwrap_or(event);
        let request_id = request_id.or_else(|| event.get("requestId").and_then(Value::as_str));
        let prefix = request_prefix(request_id);

        let envelope = match serde_json::from_value::<RequestEnvelope>(payload.clone()) {
            Ok(envelope) => envelope,
            Err(err) => return (json!({"error": format!("invalid request: {err}")}), None),
        };

        let mut request_files = RequestFiles {
            workflow: None,
            engine_home: None,
            prefix,
        };
        let result = self
            .handle_inner(&envelope, request_id, &mut request_files)
            .await;
        request_files.cleanup();

        match result {
            Ok(response) => (response, None),
            Err(err) => {
                warn!("request failed: {err:#}");
                let engine_code = err
                    .downcast_ref::<EngineError>()
                    .and_then(EngineError::engine_exit_code);
                (json!({"error": format!("{err:#}")}), engine_code)
            }
        }
    }

    async fn handle_inner(
        &self,
        envelope: &RequestEnvelope,
        request_id: Option<&str>,
        request_files: &mut RequestFiles,
    ) -> Result<Value> {
        let version_id = envelope
            .version_id
            .clone()
            .or_else(|| std::env::var("COMFY_VERSION_NAME").ok())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("version_id is required"))?;
        let version_id = version_id.trim().to_string();
        info!("request start (version_id={version_id}, request_id={request_id:?})");

        // Materialize the workflow to a tempfile.
        let workflow_path = self.materialize_workflow(envelope).await?;
        request_files.workflow = Some(workflow_path.clone());

        // Resolve and realize the version.
        let spec_path = existing_spec_path(&self.specs_dir, &version_id)?;
        let spec = VersionSpec::load(&spec_path)?;
        let git = GitCache::new(self.cache.clone());
        let lock = comfyctl_spec::resolve(&spec, &git, self.offline).await?;
        lock.persist(&self.cache)?;

        let settings = RealizeSettings {
            target: self.target.clone(),
            models_dir: envelope.models_dir.clone().map(PathBuf::from),
            offline: self.offline,
            ..RealizeSettings::default()
        };
        let env: RealizedEnv = comfyctl_realize::realize(&lock, &self.cache, &settings).await?;
        request_files.engine_home = Some(env.engine_home.clone());

        // Stage input files and rewrite the graph to the unique names.
        let mut inputs: BTreeMap<String, String> = BTreeMap::new();
        if let Some(input_images) = &envelope.input_images {
            inputs.extend(input_images.clone());
        }
        if let Some(images) = &envelope.images {
            for image in images {
                inputs.insert(image.name.clone(), image.image.clone());
            }
        }
        let mapping = stage_inputs(&inputs, &env.engine_home, &request_files.prefix).await?;
        if !mapping.is_empty() {
            let text = fs_err::read_to_string(&workflow_path)?;
            let mut workflow: Value =
                serde_json::from_str(&text).context("workflow is not valid JSON")?;
            rewrite_workflow(&mut workflow, &mapping);
            fs_err::write(&workflow_path, serde_json::to_string_pretty(&workflow)?)?;
        }

        // Execute.
        let engine_settings = EngineSettings {
            engine_home: env.engine_home.clone(),
            models_dir: env.models_dir.clone(),
            interpreter: env.interpreter.clone(),
            env: lock.env.clone(),
        };
        let artifact = self.runner.run(engine_settings, &workflow_path).await?;
        info!(
            "workflow finished: {} bytes, extension {}",
            artifact.bytes.len(),
            artifact.extension
        );
        if artifact.bytes.is_empty() {
            bail!("workflow completed but produced no output artifacts");
        }

        // Emit.
        self.emit(envelope, &version_id, request_id, artifact).await
    }

    async fn materialize_workflow(&self, envelope: &RequestEnvelope) -> Result<PathBuf> {
        let temp = tempfile::Builder::new()
            .prefix("workflow_")
            .suffix(".json")
            .tempfile()?;
        let contents = match (&envelope.workflow, &envelope.workflow_url) {
            (Some(_), Some(_)) => bail!("provide either workflow or workflow_url, not both"),
            (None, None) => bail!("workflow or workflow_url must be provided"),
            (Some(Value::String(text)), None) => text.clone(),
            (Some(workflow), None) => serde_json::to_string(workflow)?,
            (None, Some(url)) => {
                info!("downloading workflow from {url}");
                let response = reqwest::Client::new()
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("failed to download workflow from {url}"))?;
                if !response.status().is_success() {
                    bail!("workflow download from {url} returned HTTP {}", response.status());
                }
                response.text().await?
            }
        };
        fs_err::write(temp.path(), contents)?;
        let (_, path) = temp.keep()?;
        Ok(path)
    }

    async fn emit(
        &self,
        envelope: &RequestEnvelope,
        version_id: &str,
        request_id: Option<&str>,
        artifact: Artifact,
    ) -> Result<Value> {
        let mode = envelope
            .output_mode
            .clone()
            .or_else(|| std::env::var("OUTPUT_MODE").ok())
            .unwrap_or_else(|| "gcs".to_string());

        match mode.trim() {
            "base64" => {
                let out_file = envelope.out_file.as_deref().map(Path::new);
                let payload = comfyctl_sink::emit_base64(&artifact.bytes, out_file)?;
                Ok(json!({
                    "version_id": version_id,
                    "output_mode": "base64",
                    "base64": payload,
                    "size": artifact.bytes.len(),
                    "extension": artifact.extension,
                }))
            }
            "gcs" => {
                let bucket = envelope
                    .gcs_bucket
                    .clone()
                    .or_else(|| std::env::var("GCS_BUCKET").ok())
                    .filter(|bucket| !bucket.trim().is_empty())
                    .ok_or_else(|| anyhow!("GCS bucket is required for gcs output"))?;
                let prefix = envelope
                    .gcs_prefix
                    .clone()
                    .or_else(|| std::env::var("GCS_PREFIX").ok());

                let connected;
                let store: &dyn ArtifactStore = match &self.store {
                    Some(store) => store.as_ref(),
                    None => {
                        connected = GcsStore::connect(&bucket)?;
                        &connected
                    }
                };
                let size = artifact.bytes.len();
                let result = comfyctl_sink::upload(
                    store,
                    artifact.bytes,
                    &artifact.extension,
                    prefix.as_deref(),
                    request_id,
                    &UploadOptions::from_env(),
                )
                .await?;

                let mut response = json!({
                    "version_id": version_id,
                    "output_mode": "gcs",
                    "url": result.url,
                    "gcs_path": result.gcs_path,
                    "size": size,
                    "extension": result.extension,
                });
                if let Some(signed_url) = result.signed_url {
                    response["signed_url"] = Value::String(signed_url);
                }
                Ok(response)
            }
            other => bail!("unknown output mode: {other}"),
        }
    }
}


/// Per-request files that must not outlive the request.
struct RequestFiles {
    workflow: Option<PathBuf>,
    engine_home: Option<PathBuf>,
    prefix: String,
}

impl RequestFiles {
    fn cleanup(&self) {
        if let Some(workflow) = &self.workflow {
            if workflow.exists() {
                if let Err(err) = fs_err::remove_file(workflow) {
                    warn!("failed to remove workflow tempfile: {err}");
                }
            }
        }
        if let Some(engine_home) = &self.engine_home {
            let deleted = cleanup_inputs(engine_home, &self.prefix);
            if deleted > 0 {
                info!("removed {deleted} request input file(s)");
            }
        }
    }
}
