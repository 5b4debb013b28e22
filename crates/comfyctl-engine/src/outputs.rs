use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

/// Collect artifact file names from a history `outputs` value.
///
/// The outputs structure varies by plugin: per node there is a map of kinds
/// (`images`, `videos`, `gifs`, …) to arrays of file descriptors. Rather than
/// enumerate kinds, any array entry whose objects carry a `filename` key
/// contributes files. Node and kind iteration order follows the document.
pub fn collect_filenames(outputs: &Value) -> Vec<String> {
    let mut filenames = Vec::new();
    scan(outputs, &mut filenames);
    filenames
}

fn scan(value: &Value, filenames: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(filename)) = map.get("filename") {
                if !filename.is_empty() {
                    filenames.push(filename.clone());
                }
                return;
            }
            for child in map.values() {
                scan(child, filenames);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan(item, filenames);
            }
        }
        _ => {}
    }
}

/// Read and concatenate the artifacts listed in `outputs` from the engine's
/// output directory.
///
/// Returns the payload and the extension of the first file found (`.bin` when
/// none carries one). Listed files that are missing on disk are skipped with
/// a warning, matching the engine's own tolerance for partial output sets.
pub fn collect_artifacts(outputs: &Value, engine_home: &Path) -> std::io::Result<(Vec<u8>, String)> {
    let output_dir = engine_home.join("output");
    let mut payload = Vec::new();
    let mut extension: Option<String> = None;

    for filename in collect_filenames(outputs) {
        let path = output_dir.join(&filename);
        if !path.is_file() {
            warn!("artifact `{filename}` listed in outputs but missing on disk");
            continue;
        }
        payload.extend(fs_err::read(&path)?);
        if extension.is_none() {
            extension = filename
                .rsplit_once('.')
                .map(|(_, ext)| format!(".{ext}"));
        }
        debug!("collected artifact {filename}");
    }

    Ok((payload, extension.unwrap_or_else(|| ".bin".to_string())))
}
