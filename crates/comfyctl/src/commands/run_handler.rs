use std::fmt::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use comfyctl_cache::Cache;

use crate::commands::ExitStatus;
use crate::handler::RequestShell;
use crate::printer::Printer;

pub(crate) struct RunHandlerOptions {
    pub(crate) workflow: PathBuf,
    pub(crate) output: String,
    pub(crate) out_file: Option<PathBuf>,
    pub(crate) gcs_bucket: Option<String>,
    pub(crate) gcs_prefix: Option<String>,
    pub(crate) models_dir: Option<PathBuf>,
    pub(crate) offline: bool,
}

/// Run one request through the request shell.
///
/// Equivalent to what the serverless dispatcher does per event, driven from
/// the command line: base64 output lands on stdout, gcs output prints the
/// object path.
pub(crate) async fn run_handler(
    version_id: &str,
    specs_dir: &Path,
    cache: &Cache,
    args: RunHandlerOptions,
    mut printer: Printer,
) -> Result<ExitStatus> {
    let workflow_text = fs_err::read_to_string(&args.workflow)
        .with_context(|| format!("failed to read workflow {}", args.workflow.display()))?;

    let mut event = json!({
        "version_id": version_id,
        "workflow": workflow_text,
        "output_mode": args.output,
    });
    if let Some(out_file) = &args.out_file {
        event["out_file"] = Value::String(out_file.display().to_string());
    }
    if let Some(bucket) = &args.gcs_bucket {
        event["gcs_bucket"] = Value::String(bucket.clone());
    }
    if let Some(prefix) = &args.gcs_prefix {
        event["gcs_prefix"] = Value::String(prefix.clone());
    }
    if let Some(models_dir) = &args.models_dir {
        event["models_dir"] = Value::String(models_dir.display().to_string());
    }

    let mut shell = RequestShell::new(cache.clone(), specs_dir.to_path_buf());
    shell.offline = args.offline;
    let (response, engine_code) = shell.handle(&event, None).await;

    if let Some(error) = response.get("error").and_then(Value::as_str) {
        writeln!(printer, "error: {error}")?;
        return Ok(engine_code.map_or(ExitStatus::Failure, ExitStatus::Engine));
    }

    match response.get("output_mode").and_then(Value::as_str) {
        Some("base64") => {
            if args.out_file.is_some() {
                writeln!(
                    printer,
                    "base64 payload written to {}",
                    args.out_file.as_deref().unwrap_or(Path::new("-")).display()
                )?;
            } else if let Some(payload) = response.get("base64").and_then(Value::as_str) {
                #[allow(clippy::print_stdout)]
                {
                    println!("{payload}");
                }
            }
        }
        _ => {
            // The object path leads so scripts can read the first line.
            if let Some(gcs_path) = response.get("gcs_path").and_then(Value::as_str) {
                #[allow(clippy::print_stdout)]
                {
                    println!("{gcs_path}");
                }
            }
            writeln!(printer, "{}", serde_json::to_string_pretty(&response)?)?;
        }
    }
    Ok(ExitStatus::Success)
}
